mod realtime_selftest;

//! Binary-level tests: argument handling, sleep timing and a full wake
//! cycle against a local HTTP server.

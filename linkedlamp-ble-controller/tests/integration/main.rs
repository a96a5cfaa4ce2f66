//! Integration test driver for `tests/integration/`.
//!
//! Every test drives the provisioning engine against `mock_ble`, a
//! simulated central with a scripted lamp. No Bluetooth hardware needed.

mod session_tests;

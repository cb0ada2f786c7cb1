// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use std::time::Duration;

/// UDP port the CV2 card listens on.
pub const DEFAULT_PORT: u16 = 57010;

/// Per-attempt response timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Retries after the first attempt (3 attempts total).
pub const DEFAULT_RETRIES: u32 = 2;

/// Polling cadence.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Largest datagram the card sends.
pub const MAX_DATAGRAM: usize = 4096;

/// Device class used to address the CV2 card itself.
pub const CV2_CLASS: &str = "cv2";

/// Length of a CV2 MAC/token in hex characters.
pub const TOKEN_LEN: usize = 12;

/// Number of trailing token characters that must never appear in diagnostics.
pub const TOKEN_SECRET_LEN: usize = 6;

/// Replacement for the secret part of the token.
pub const TOKEN_MASK: &str = "XXXXXX";

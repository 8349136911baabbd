//! Wire framing for streamed lines
//!
//! Streamed program lines go out as `N<lineno> <body>*<checksum>\n`. The
//! checksum is the XOR of every byte before the `*`; the firmware verifies
//! it and answers `Resend: <n>` on mismatch. Query commands sent outside a
//! program go out verbatim, without a line number.

/// XOR checksum over the framed text, excluding the `*<cs>` tail
///
/// Operates on raw 8-bit values; bytes above 0x7F pass through unchanged
/// (comments are stripped before framing, so they never reach the wire).
pub fn checksum(data: &str) -> u8 {
    data.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Frame a body for transmission with a line number and checksum
pub fn frame(line_number: usize, body: &str) -> String {
    let numbered = format!("N{} {}", line_number, body);
    let cs = checksum(&numbered);
    format!("{}*{}", numbered, cs)
}

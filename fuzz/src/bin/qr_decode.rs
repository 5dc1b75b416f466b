#[macro_use]
extern crate afl;
use keyverify::QrCodeData;

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(code) = QrCodeData::from_bytes(data) {
            // Anything we accept must encode again.
            let _ = code.to_bytes();
        }
        if let Ok(text) = std::str::from_utf8(data) {
            let _ = QrCodeData::from_encoded_string(text);
        }
    });
}

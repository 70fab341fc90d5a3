//! Fuzz harness for `parse_flux_csv`.
//!
//! Replica responses are untrusted input. The parser must return either
//! rows or an error for arbitrary bytes and never panic. Unnamed columns
//! never make it into a row.

#![no_main]
use libfuzzer_sys::fuzz_target;
use replverify_core::store::influx::parse_flux_csv;

fuzz_target!(|data: &[u8]| {
    let body = String::from_utf8_lossy(data);
    if let Ok(rows) = parse_flux_csv(&body) {
        for row in rows {
            assert!(row.keys().all(|column| !column.is_empty()));
        }
    }
});

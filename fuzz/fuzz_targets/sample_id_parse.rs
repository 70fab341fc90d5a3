//! Fuzz harness for `SampleId::parse`.
//!
//! Anything that parses must print back to a string that parses to the
//! same identity.

#![no_main]
use libfuzzer_sys::fuzz_target;
use replverify_core::SampleId;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(id) = SampleId::parse(text) {
        assert_eq!(SampleId::parse(&id.to_string()), Some(id));
    }
});

#![no_main]
use gxstunnel::items::classify_frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = classify_frame(data);
});

#![no_main]
use gxstunnel::TunnelItem;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Some(item) = TunnelItem::decode(data) {
        // Anything that decodes must re-encode to the same bytes.
        let encoded = item.encode().unwrap();
        assert_eq!(encoded, data);
    }
});

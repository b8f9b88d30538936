#![no_main]

use dtm_core::snapshot::{try_snapshot_args, BlockCache, SliceRegion};
use dtm_core::split::Splitter;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let data = if data.len() > 64 * 1024 {
        &data[..64 * 1024]
    } else {
        data
    };
    let Some((&knob, body)) = data.split_first() else {
        return;
    };

    // Arbitrary text must split without reading past its end.
    for arg in Splitter::new(body).with_max_len(usize::from(knob) + 1) {
        let Ok(arg) = arg else {
            return;
        };
        assert!(arg.bytes.len() <= usize::from(knob) + 1);
        assert!(arg.decoded_len >= arg.bytes.len());
    }
    // The same bytes as an argument region: the snapshot stays inside its buffer
    // and every argument it holds splits back out.
    let argc = body.iter().filter(|&&b| b == 0).count().max(1);
    let block_size = usize::from(knob % 64) + 1;
    let mut region = SliceRegion::new(body, block_size);
    let Ok(blob) = try_snapshot_args(&mut region, &mut BlockCache::new(), 0, argc, 256) else {
        return;
    };
    assert!(blob.len() < blob.capacity());
    assert_eq!(blob.as_bytes_with_nul().last(), Some(&0));
    let split = Splitter::new(blob.as_bytes()).count();
    assert!(split <= blob.encoded_args() + usize::from(blob.is_truncated()));
});

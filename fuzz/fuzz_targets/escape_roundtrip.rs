#![no_main]

use dtm_core::codec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let data = if data.len() > 64 * 1024 {
        &data[..64 * 1024]
    } else {
        data
    };

    let escaped = codec::escape(data);
    assert!(escaped
        .iter()
        .all(|&b| b.is_ascii_graphic() || b == codec::DELIMITER));
    assert_eq!(
        escaped.iter().filter(|&&b| b == codec::DELIMITER).count(),
        data.iter().filter(|&&b| b == 0).count()
    );

    let Ok(decoded) = codec::unescape(&escaped) else {
        return;
    };
    assert_eq!(decoded, data);
});

#![no_main]

use bytes::{Buf, BytesMut};
use cancellable_sql::pg::protocol::decode::decode_message;
use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

#[derive(Debug)]
struct ChunkedInput {
    data: Vec<u8>,
    split_points: Vec<u8>,
}

impl<'a> Arbitrary<'a> for ChunkedInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        Ok(Self {
            data: u.arbitrary()?,
            split_points: u.arbitrary()?,
        })
    }
}

// Whatever the chunking, the decoder must see the same message boundaries.
fuzz_target!(|input: ChunkedInput| {
    if input.data.is_empty() {
        return;
    }

    let mut whole = Vec::new();
    let mut offset = 0;
    while let Ok(Some((_, used))) = decode_message(&input.data[offset..]) {
        whole.push(used);
        offset += used;
    }

    let mut splits: Vec<usize> = input
        .split_points
        .iter()
        .map(|&b| (b as usize) % (input.data.len() + 1))
        .collect();
    splits.push(0);
    splits.push(input.data.len());
    splits.sort_unstable();
    splits.dedup();

    let mut buf = BytesMut::new();
    let mut chunked = Vec::new();
    'feed: for window in splits.windows(2) {
        buf.extend_from_slice(&input.data[window[0]..window[1]]);
        loop {
            match decode_message(&buf) {
                Ok(Some((_, used))) => {
                    chunked.push(used);
                    buf.advance(used);
                }
                Ok(None) => break,
                Err(_) => break 'feed,
            }
        }
    }

    assert!(chunked.len() <= whole.len());
    assert_eq!(&whole[..chunked.len()], &chunked[..]);
});

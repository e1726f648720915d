//! Property tests for the frame decoder against hostile stream input.

use proptest::prelude::*;
use sprocket::net::{
    Endpoint, Frame, FrameReader, HEADER_SIZE, MAX_MESSAGE_LENGTH, Message, MessageCounter,
    MessageHeader, PlayerId, validate,
};

fn frame_to(to: Endpoint, message: Message) -> Frame {
    let mut counter = MessageCounter::default();
    let mut header = MessageHeader::cleared(&mut counter);
    header.from = Endpoint::HOST;
    header.to = to;
    Frame::stamp(&mut header, &message);
    Frame { header, message }
}

/// Pulls frames until the reader has nothing complete left.
fn drain(reader: &mut FrameReader) -> usize {
    let mut seen = 0;
    while reader.next_frame().is_some() {
        seen += 1;
        assert!(seen <= MAX_MESSAGE_LENGTH * 8, "reader never ran dry");
    }
    seen
}

proptest! {
    /// Property: arbitrary bytes never panic the header check or the decoder
    #[test]
    fn arbitrary_bytes_dont_crash_decoder(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let _header = validate(&random_bytes);
        let _frame = Frame::decode(&random_bytes);
    }

    /// Property: arbitrary chunks fed to the stream reader never panic and
    /// never leave more than one frame's worth of garbage behind
    #[test]
    fn arbitrary_chunks_dont_crash_reader(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 0..20),
    ) {
        let mut reader = FrameReader::new();
        for chunk in &chunks {
            reader.extend(chunk);
            drain(&mut reader);
        }
        prop_assert!(reader.buffered() < MAX_MESSAGE_LENGTH);
    }

    /// Property: a valid frame split anywhere still decodes once complete
    #[test]
    fn split_frame_reassembles(
        split in 0usize..64,
        slot in 1usize..6,
        name in "[A-Z]{0,40}",
    ) {
        let original = frame_to(
            Endpoint::Player(PlayerId::new(slot).unwrap()),
            Message::JoinRequest { name },
        );
        let bytes = original.to_bytes().unwrap();
        let split = split.min(bytes.len());

        let mut reader = FrameReader::new();
        reader.extend(&bytes[..split]);
        if split < bytes.len() {
            prop_assert!(reader.next_frame().is_none());
        }
        reader.extend(&bytes[split..]);

        let decoded = reader.next_frame().unwrap().unwrap();
        prop_assert_eq!(decoded.header, original.header);
        prop_assert!(reader.next_frame().is_none());
    }

    /// Property: a header-sized prefix of random bytes is either rejected or
    /// waits for more input, and never yields a frame on its own
    #[test]
    fn short_garbage_never_yields_frame(
        random_bytes in prop::collection::vec(any::<u8>(), 0..HEADER_SIZE),
    ) {
        let mut reader = FrameReader::new();
        reader.extend(&random_bytes);
        match reader.next_frame() {
            None | Some(Err(_)) => {}
            Some(Ok(frame)) => prop_assert!(
                false,
                "decoded {:?} from {} bytes",
                frame,
                random_bytes.len()
            ),
        }
    }
}

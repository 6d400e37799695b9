use bytes::BytesMut;
use rstest::rstest;
use telemux::network::{encode_frame, Crc8, Frame, FRAME_OVERHEAD};
use telemux::AppError;

const MAX: usize = 519;

#[test]
fn test_decode_concrete_frame() {
    let wire = [0x00, 0x09, 0x05, 0x10, 0x00, 0x02, 0x01, 0x02, 0xDD];
    assert_eq!(Crc8::checksum(&wire[2..8]), 0xDD);

    let frame = Frame::parse(&wire, MAX).unwrap().unwrap();
    assert_eq!(frame.header.total_length, 9);
    assert_eq!(frame.header.seq, 0x05);
    assert_eq!(frame.header.code, 0x10);
    assert_eq!(frame.header.command_length, 2);
    assert_eq!(frame.payload, &[0x01, 0x02]);
    assert!(frame.validate().is_ok());
}

#[test]
fn test_encode_ping_response() {
    let mut out = BytesMut::new();
    encode_frame(&mut out, 0x00, 0xC1, &[]).unwrap();
    assert_eq!(&out[..], &[0x00, 0x07, 0x00, 0xC1, 0x00, 0x00, 0x37]);
}

#[rstest]
#[case::empty(0, 0x00, vec![])]
#[case::one_byte(7, 0x81, vec![0xAB])]
#[case::full_payload(255, 0x04, vec![0x5A; MAX - FRAME_OVERHEAD])]
fn test_encoded_frame_parses_back(#[case] seq: u8, #[case] code: u8, #[case] payload: Vec<u8>) {
    let mut out = BytesMut::new();
    encode_frame(&mut out, seq, code, &payload).unwrap();
    assert_eq!(out.len(), payload.len() + FRAME_OVERHEAD);

    let frame = Frame::parse(&out, MAX).unwrap().unwrap();
    assert_eq!(frame.header.seq, seq);
    assert_eq!(frame.header.code, code);
    assert_eq!(frame.payload, &payload[..]);
    assert!(frame.validate().is_ok());
}

#[rstest]
fn test_any_bit_flip_is_detected(#[values(2, 3, 4, 5, 6, 7, 8)] index: usize, #[values(0x01, 0x10, 0x80)] bit: u8) {
    let mut wire = vec![0x00, 0x09, 0x05, 0x10, 0x00, 0x02, 0x01, 0x02, 0xDD];
    wire[index] ^= bit;
    match Frame::parse(&wire, MAX) {
        Ok(Some(frame)) => assert!(matches!(frame.validate(), Err(AppError::ChecksumInvalid { .. }))),
        // flips in the command length are caught by the length check instead
        Err(err) => assert!(matches!(err, AppError::FrameLengthMismatch { .. })),
        Ok(None) => panic!("complete frame reported as partial"),
    }
}

#[rstest]
fn test_total_length_bit_flip_never_yields_valid_frame(
    #[values(0, 1)] index: usize,
    #[values(0x01, 0x02, 0x10, 0x80)] bit: u8,
) {
    let mut wire = vec![0x00, 0x09, 0x05, 0x10, 0x00, 0x02, 0x01, 0x02, 0xDD];
    wire[index] ^= bit;
    match Frame::parse(&wire, MAX) {
        Ok(Some(frame)) => assert!(frame.validate().is_err()),
        // a longer declared length just waits for bytes that never come
        Ok(None) => assert!(u16::from_be_bytes([wire[0], wire[1]]) as usize > wire.len()),
        Err(err) => assert!(matches!(
            err,
            AppError::FrameTooLarge { .. } | AppError::FrameLengthMismatch { .. }
        )),
    }
}

#[test]
fn test_partial_frame_waits_for_more() {
    let wire = [0x00, 0x09, 0x05, 0x10, 0x00, 0x02, 0x01, 0x02, 0xDD];
    for cut in 0..wire.len() {
        assert!(Frame::parse(&wire[..cut], MAX).unwrap().is_none(), "cut at {}", cut);
    }
}

#[test]
fn test_declared_length_above_limit() {
    let wire = [0x02, 0x08, 0x00, 0xC1];
    assert!(matches!(
        Frame::parse(&wire, MAX),
        Err(AppError::FrameTooLarge { length: 520, max: MAX })
    ));
}

#[test]
fn test_oversized_payload_is_rejected_by_encoder() {
    let mut out = BytesMut::new();
    let payload = vec![0u8; u16::MAX as usize];
    assert!(encode_frame(&mut out, 0, 0, &payload).is_err());
}

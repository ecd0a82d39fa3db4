use super::*;
use bytes::{BufMut, Bytes, BytesMut};

#[test]
fn test_handshake_encode_decode() {
    let info_hash = [1u8; 20];
    let peer_id = [2u8; 20];

    let handshake = Handshake::new(info_hash, peer_id);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, info_hash);
    assert_eq!(decoded.peer_id, peer_id);
    assert_eq!(decoded.reserved, [0u8; 8]);
}

#[test]
fn test_handshake_rejects_wrong_protocol() {
    let mut bad = BytesMut::from(&Handshake::new([0; 20], [0; 20]).encode()[..]);
    bad[1] = b'X';
    assert!(matches!(
        Handshake::decode(&bad),
        Err(WireError::InvalidHandshake)
    ));

    assert!(matches!(
        Handshake::decode(&[0x13; 10]),
        Err(WireError::InvalidHandshake)
    ));
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xff, 0x00])),
        Message::Request {
            index: 1,
            begin: 0,
            length: 16384,
        },
        Message::Piece {
            index: 3,
            begin: 16384,
            data: Bytes::from_static(b"hello world"),
        },
        Message::Cancel {
            index: 1,
            begin: 0,
            length: 16384,
        },
    ];

    for msg in messages {
        let encoded = msg.encode();
        let decoded = Message::decode(encoded).unwrap().unwrap();
        assert_eq!(msg, decoded);
    }
}

#[test]
fn test_keepalive_is_zero_length_frame() {
    let encoded = Message::KeepAlive.encode();
    assert_eq!(&encoded[..], &[0, 0, 0, 0]);
    assert_eq!(
        Message::decode(encoded).unwrap(),
        Some(Message::KeepAlive)
    );
}

#[test]
fn test_unknown_message_id_is_skipped() {
    let mut buf = BytesMut::new();
    buf.put_u32(3);
    buf.put_u8(20); // extension protocol id, outside our set
    buf.put_slice(&[0xde, 0xad]);
    assert_eq!(Message::decode(buf.freeze()).unwrap(), None);
}

#[test]
fn test_truncated_known_message_is_an_error() {
    // a request message whose payload stops after the index
    let mut buf = BytesMut::new();
    buf.put_u32(5);
    buf.put_u8(MessageId::Request as u8);
    buf.put_u32(7);
    assert!(matches!(
        Message::decode(buf.freeze()),
        Err(WireError::Truncated(_))
    ));
}

#[test]
fn test_framer_handshake_then_messages_in_one_chunk() {
    let handshake = Handshake::new([3u8; 20], [4u8; 20]).encode();
    let interested = Message::Interested.encode();
    let have = Message::Have { piece: 9 }.encode();

    let mut stream = BytesMut::new();
    stream.put_slice(&handshake);
    stream.put_slice(&interested);
    stream.put_slice(&have);

    let mut framer = Framer::new(UnpackRule::Handshake);
    framer.feed(&stream);

    let first = framer.next_frame().unwrap().unwrap();
    assert_eq!(&first[..], &handshake[..]);

    framer.set_rule(UnpackRule::Message);
    let second = framer.next_frame().unwrap().unwrap();
    assert_eq!(Message::decode(second).unwrap(), Some(Message::Interested));
    let third = framer.next_frame().unwrap().unwrap();
    assert_eq!(
        Message::decode(third).unwrap(),
        Some(Message::Have { piece: 9 })
    );
    assert_eq!(framer.buffered(), 0);
    assert!(framer.next_frame().unwrap().is_none());
}

#[test]
fn test_framer_byte_at_a_time_matches_one_shot() {
    let mut stream = BytesMut::new();
    stream.put_slice(&Message::Unchoke.encode());
    stream.put_slice(&Message::Have { piece: 1 }.encode());
    stream.put_slice(
        &Message::Piece {
            index: 0,
            begin: 0,
            data: Bytes::from_static(&[7u8; 64]),
        }
        .encode(),
    );
    stream.put_slice(&Message::KeepAlive.encode());

    let mut one_shot = Framer::new(UnpackRule::Message);
    one_shot.feed(&stream);
    let mut expected = Vec::new();
    while let Some(frame) = one_shot.next_frame().unwrap() {
        expected.push(frame);
    }

    let mut trickle = Framer::new(UnpackRule::Message);
    let mut got = Vec::new();
    for byte in stream.iter() {
        trickle.feed(&[*byte]);
        while let Some(frame) = trickle.next_frame().unwrap() {
            got.push(frame);
        }
    }

    assert_eq!(expected.len(), 4);
    assert_eq!(got, expected);
    assert_eq!(trickle.buffered(), 0);
}

#[test]
fn test_framer_residual_accounting() {
    let request = Message::Request {
        index: 0,
        begin: 0,
        length: 16384,
    }
    .encode();

    let mut framer = Framer::new(UnpackRule::Message);
    // feed everything but the last byte
    framer.feed(&request[..request.len() - 1]);
    assert!(framer.next_frame().unwrap().is_none());
    assert_eq!(framer.buffered(), request.len() - 1);

    framer.feed(&request[request.len() - 1..]);
    let frame = framer.next_frame().unwrap().unwrap();
    assert_eq!(frame.len(), request.len());
    assert_eq!(framer.buffered(), 0);
}

#[test]
fn test_framer_rejects_oversized_length_prefix() {
    let mut buf = BytesMut::new();
    buf.put_u32(crate::constants::MAX_FRAME_PAYLOAD as u32 + 1);

    let mut framer = Framer::new(UnpackRule::Message);
    framer.feed(&buf);
    assert!(matches!(
        framer.next_frame(),
        Err(WireError::FrameTooLarge(_))
    ));
}

#[test]
fn test_framer_rejects_non_handshake_opening() {
    let mut framer = Framer::new(UnpackRule::Handshake);
    framer.feed(&[0x00, 0x01, 0x02]);
    assert!(matches!(
        framer.next_frame(),
        Err(WireError::InvalidHandshake)
    ));
}

#[test]
fn test_framer_clear_discards_buffer() {
    let mut framer = Framer::new(UnpackRule::Message);
    framer.feed(&[0, 0, 0]);
    assert_eq!(framer.buffered(), 3);
    framer.clear();
    assert_eq!(framer.buffered(), 0);
    assert!(framer.next_frame().unwrap().is_none());
}

use std::io::Cursor;
use std::path::PathBuf;

use kestrel_core::{CacheKey, Candidate, RequestOptions, SyntheticSource};
use kestrel_remote_proto::transport::{self, decode_framed_message, encode_framed_message};
use kestrel_remote_proto::{
    read_message, write_message, BackendMessage, CompletionRequest, EngineVersion, Handshake,
    ProtocolError, MAX_FRAME_BYTES,
};
use proptest::prelude::*;

fn sample_request() -> CompletionRequest {
    CompletionRequest {
        cache_key: CacheKey::ScopedDot {
            file_hash: "abc123".into(),
            scope: vec!["outer".into(), "inner".into()],
            object: "foo".into(),
        },
        dependencies: vec![PathBuf::from("/proj/example.py")],
        source: "def outer():\n    def inner():\n        foo.ba\n".into(),
        line: 3,
        column: 14,
        filename: Some(PathBuf::from("/proj/example.py")),
        options: Some(RequestOptions {
            extra_path: vec![PathBuf::from("/proj/vendor")],
            synthetic: Some(SyntheticSource {
                source: "import foo\nfoo.".into(),
                line: 2,
                column: 4,
            }),
        }),
    }
}

#[test]
fn stream_carries_handshake_then_responses() {
    let mut wire = Vec::new();
    let handshake = BackendMessage::Handshake(Handshake::new(EngineVersion {
        name: "lexical".into(),
        version: "0.1.0".into(),
    }));
    let completions = BackendMessage::Completions(Some(vec![
        Candidate::new("join", "function").with_params(vec!["a".into(), "*p".into()]),
    ]));
    write_message(&mut wire, &handshake).unwrap();
    write_message(&mut wire, &completions).unwrap();
    write_message(&mut wire, &BackendMessage::Completions(None)).unwrap();

    let mut reader = Cursor::new(wire);
    let read = |reader: &mut Cursor<Vec<u8>>| read_message::<_, BackendMessage>(reader).unwrap();
    assert_eq!(read(&mut reader), Some(handshake));
    assert_eq!(read(&mut reader), Some(completions));
    assert_eq!(read(&mut reader), Some(BackendMessage::Completions(None)));
    // Clean EOF between frames is the shutdown signal.
    assert_eq!(read(&mut reader), None);
}

#[test]
fn partial_length_prefix_is_a_protocol_error() {
    let mut reader = Cursor::new(vec![7u8, 0]);
    let err = read_message::<_, BackendMessage>(&mut reader).unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Truncated {
            expected: 4,
            got: 2
        }
    ));
}

#[test]
fn declared_length_beyond_available_bytes_is_rejected() {
    let frame = encode_framed_message(&sample_request()).unwrap();
    let truncated = frame[..frame.len() - 3].to_vec();

    let err = read_message::<_, CompletionRequest>(&mut Cursor::new(truncated.clone())).unwrap_err();
    assert!(matches!(err, ProtocolError::Truncated { .. }), "{err:?}");

    let err = decode_framed_message::<CompletionRequest>(&truncated).unwrap_err();
    assert!(matches!(err, ProtocolError::Truncated { .. }), "{err:?}");
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut frame = encode_framed_message(&sample_request()).unwrap();
    frame.push(0);
    assert!(matches!(
        decode_framed_message::<CompletionRequest>(&frame),
        Err(ProtocolError::TrailingBytes(1))
    ));
}

#[test]
fn oversized_len_prefix_is_rejected_without_allocating() {
    let oversized = (MAX_FRAME_BYTES as u32).saturating_add(1);
    let mut reader = Cursor::new(oversized.to_le_bytes().to_vec());
    let err = read_message::<_, BackendMessage>(&mut reader).unwrap_err();
    assert!(matches!(err, ProtocolError::FrameTooLarge { .. }), "{err:?}");

    let mut reader = Cursor::new(u32::MAX.to_le_bytes().to_vec());
    assert!(read_message::<_, BackendMessage>(&mut reader).is_err());
}

#[test]
fn garbage_payload_fails_to_decode() {
    let frame = transport::encode_frame(&[0xff; 3]).unwrap();
    let err = read_message::<_, BackendMessage>(&mut Cursor::new(frame)).unwrap_err();
    assert!(matches!(err, ProtocolError::Decode(_)), "{err:?}");
}

fn arb_key() -> impl Strategy<Value = CacheKey> {
    prop_oneof![
        Just(CacheKey::Import),
        Just(CacheKey::Boilerplate),
        any::<u64>().prop_map(|id| CacheKey::Direct { id }),
        "[a-z_.]{1,12}".prop_map(|module| CacheKey::Package { module }),
        "[a-z_.]{1,12}".prop_map(|module| CacheKey::From { module }),
        ("[0-9a-f]{8}", prop::collection::vec("[A-Za-z_]{1,8}", 0..4))
            .prop_map(|(file_hash, scope)| CacheKey::ScopedVars { file_hash, scope }),
    ]
}

fn arb_candidate() -> impl Strategy<Value = Candidate> {
    (
        "[A-Za-z_]{1,10}",
        "(function|class|module|statement)",
        proptest::option::of(prop::collection::vec("[a-z*=]{1,6}", 0..3)),
        proptest::option::of(".{0,20}"),
    )
        .prop_map(|(name, kind, params, doc)| {
            let mut candidate = Candidate::new(name, kind);
            candidate.params = params;
            candidate.doc = doc;
            candidate
        })
}

proptest! {
    #[test]
    fn request_frames_round_trip(
        cache_key in arb_key(),
        source in ".{0,64}",
        line in 1u32..500,
        column in 0u32..120,
    ) {
        let request = CompletionRequest {
            cache_key,
            source,
            line,
            column,
            ..sample_request()
        };
        let frame = encode_framed_message(&request).unwrap();
        let decoded: CompletionRequest = decode_framed_message(&frame).unwrap();
        prop_assert_eq!(&decoded, &request);
        prop_assert_eq!(encode_framed_message(&decoded).unwrap(), frame);
    }

    #[test]
    fn response_frames_round_trip(candidates in proptest::option::of(prop::collection::vec(arb_candidate(), 0..6))) {
        let message = BackendMessage::Completions(candidates);
        let mut wire = Vec::new();
        write_message(&mut wire, &message).unwrap();
        let decoded: Option<BackendMessage> = read_message(&mut Cursor::new(wire)).unwrap();
        prop_assert_eq!(decoded, Some(message));
    }
}

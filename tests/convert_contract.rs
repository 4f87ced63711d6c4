// Library-level contract tests for the pickle → JSON pipeline.
use pickle2json::api::{
    EncodeOptions, ErrorKind, NonFinite, NormalizeOptions, OutputStyle, PyValue, convert_bytes,
    normalize, unpickle,
};

fn convert(bytes: &[u8]) -> String {
    let converted = convert_bytes(bytes, &NormalizeOptions::default(), &EncodeOptions::default())
        .expect("convert");
    String::from_utf8(converted.json).expect("utf8")
}

#[test]
fn memo_aliases_render_twice() {
    // x = [1]; pickle.dumps([x, x], protocol=2)
    assert_eq!(convert(b"\x80\x02]q\x00(]q\x01K\x01ah\x01e."), "[[1], [1]]");
}

#[test]
fn self_referencing_list_is_rejected() {
    // a = []; a.append(a); pickle.dumps(a, protocol=2)
    let err = convert_bytes(
        b"\x80\x02]q\x00h\x00a.",
        &NormalizeOptions::default(),
        &EncodeOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSerializable);
    assert!(err.to_string().contains("Circular reference detected"));
}

#[test]
fn int_keys_are_stringified() {
    // pickle.dumps({1: "x"}, protocol=2)
    assert_eq!(convert(b"\x80\x02}q\x00K\x01X\x01\x00\x00\x00xs."), r#"{"1": "x"}"#);
}

#[test]
fn tuples_become_lists() {
    // pickle.dumps((1, "a", None), protocol=2)
    assert_eq!(
        convert(b"\x80\x02K\x01X\x01\x00\x00\x00aN\x87q\x00."),
        r#"[1, "a", null]"#
    );
}

#[test]
fn non_finite_floats_follow_policy() {
    // pickle.dumps([float("nan"), 1.0], protocol=2)
    let stream =
        b"\x80\x02]q\x00(G\x7f\xf8\x00\x00\x00\x00\x00\x00G?\xf0\x00\x00\x00\x00\x00\x00e.";
    assert_eq!(convert(stream), "[null, 1.0]");

    let strict = NormalizeOptions {
        non_finite: NonFinite::Error,
        ..NormalizeOptions::default()
    };
    let err = convert_bytes(stream, &strict, &EncodeOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSerializable);
}

#[test]
fn non_ascii_text_respects_ensure_ascii() {
    // pickle.dumps("\u00e9", protocol=2)
    let stream = b"\x80\x02X\x02\x00\x00\x00\xc3\xa9q\x00.";
    assert_eq!(convert(stream), r#""\u00e9""#);

    let raw = EncodeOptions {
        style: OutputStyle::Spaced,
        ensure_ascii: false,
    };
    let converted = convert_bytes(stream, &NormalizeOptions::default(), &raw).unwrap();
    assert_eq!(converted.json, "\"\u{e9}\"".as_bytes());
}

#[test]
fn unpickle_exposes_shared_containers() {
    let value = unpickle(b"\x80\x02]q\x00(]q\x01K\x01ah\x01e.").unwrap();
    let PyValue::List(outer) = &value else {
        panic!("expected list");
    };
    let outer = outer.borrow();
    assert_eq!(outer.len(), 2);
    assert_eq!(outer[0].identity(), outer[1].identity());
}

#[test]
fn unknown_opcode_is_corrupt() {
    let err = unpickle(b"\x80\x02\xff.").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert!(err.offset().is_some());
}

#[test]
fn protocols_encode_the_same_mapping_identically() {
    let streams: [&[u8]; 4] = [
        // protocol 0
        b"(dp0\nVa\np1\nI1\ns.",
        // protocol 2
        b"\x80\x02}q\x00X\x01\x00\x00\x00aq\x01K\x01s.",
        // protocol 4, framed
        b"\x80\x04\x95\x0a\x00\x00\x00\x00\x00\x00\x00}\x94\x8c\x01a\x94K\x01s.",
        // protocol 5, framed
        b"\x80\x05\x95\x0a\x00\x00\x00\x00\x00\x00\x00}\x94\x8c\x01a\x94K\x01s.",
    ];
    for stream in streams {
        assert_eq!(convert(stream), r#"{"a": 1}"#);
    }
}

#[test]
fn output_parses_back_to_normalized_value() {
    // pickle.dumps({"k": [1, 2.5, None, True]}, protocol=2)
    let stream = b"\x80\x02}q\x00X\x01\x00\x00\x00kq\x01]q\x02(K\x01G@\x04\x00\x00\x00\x00\x00\x00N\x88es.";
    let value = unpickle(stream).unwrap();
    let normalized = normalize(&value, &NormalizeOptions::default()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&convert(stream)).unwrap();
    assert_eq!(parsed, normalized);
    assert_eq!(parsed, serde_json::json!({"k": [1, 2.5, null, true]}));
}

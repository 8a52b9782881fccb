//! §8 concrete scenarios 4 and 6: a composite-message round trip against
//! the spec's exact expected wire bytes, and a large chunked stream driven
//! end-to-end through a small fixed buffer.

use std::sync::{Arc, Mutex};

use solidframe_core::config::Limits;
use solidframe_core::serialization::{Deserializer, Serializer};

#[test]
fn composite_message_roundtrips_with_expected_wire_bytes() {
    let mut ser = Serializer::new(Limits::default());
    ser.push_u32(0xDEAD_BEEF);
    ser.push_str("hello").unwrap();
    ser.push_container(vec![1u16, 2, 3], &Limits::default(), |v, s| {
        s.push_u32(v as u32);
    })
    .unwrap();

    let mut buf = [0u8; 64];
    let n = ser.run(&mut buf).unwrap();
    assert!(ser.is_idle());

    // u32(0xDEADBEEF): cross-integer len=4, little-endian bytes.
    // "hello": length header is itself a cross-integer ([1,5]), then the
    // 5 ASCII bytes.
    // container of 3 elements: cross-integer count=3 ([1,3]), then each
    // element as a u32 cross-integer ([1,1], [1,2], [1,3]).
    let expected: &[u8] = &[
        4, 0xEF, 0xBE, 0xAD, 0xDE, // u32
        1, 5, b'h', b'e', b'l', b'l', b'o', // string
        1, 3, // container count = 3
        1, 1, // element 0 = 1
        1, 2, // element 1 = 2
        1, 3, // element 2 = 3
    ];
    assert_eq!(&buf[.. n], expected);

    let mut de = Deserializer::new(Limits::default());
    let got_u32 = Arc::new(Mutex::new(0u32));
    let got_str = Arc::new(Mutex::new(String::new()));
    let got_vec = Arc::new(Mutex::new(Vec::new()));
    {
        let got_u32 = got_u32.clone();
        de.pull_u32(move |v| *got_u32.lock().unwrap() = v);
    }
    {
        let got_str = got_str.clone();
        de.pull_str(move |r| *got_str.lock().unwrap() = r.unwrap());
    }
    {
        let got_vec = got_vec.clone();
        de.pull_container(&Limits::default(), move |d| {
            let got_vec = got_vec.clone();
            d.pull_u32(move |v| got_vec.lock().unwrap().push(v as u16));
        });
    }
    let consumed = de.run(&buf[.. n]).unwrap();
    assert_eq!(consumed, n);
    assert!(de.is_idle());

    assert_eq!(*got_u32.lock().unwrap(), 0xDEAD_BEEF);
    assert_eq!(*got_str.lock().unwrap(), "hello");
    assert_eq!(*got_vec.lock().unwrap(), vec![1u16, 2, 3]);
}

#[test]
fn chunked_stream_roundtrips_through_a_small_fixed_buffer() {
    let source = vec![0x5Au8; 100_000];

    let mut ser = Serializer::new(Limits::default());
    let progress = Arc::new(Mutex::new(Vec::new()));
    {
        let progress = progress.clone();
        let cursor = std::io::Cursor::new(source.clone());
        ser.push_stream("payload", cursor, move |bytes, done, _name| {
            progress.lock().unwrap().push((bytes, done));
        });
    }

    let mut wire = Vec::new();
    loop {
        let mut chunk = [0u8; 4096];
        let n = ser.run(&mut chunk).unwrap();
        wire.extend_from_slice(&chunk[.. n]);
        if ser.is_idle() {
            break;
        }
    }
    assert_eq!(progress.lock().unwrap().last(), Some(&(100_000, true)));
    assert!(progress.lock().unwrap().len() >= 25);

    let mut de = Deserializer::new(Limits::default());
    let sink = Arc::new(Mutex::new(Vec::new()));
    let decode_progress = Arc::new(Mutex::new(Vec::new()));
    {
        let sink_clone = sink.clone();
        let decode_progress = decode_progress.clone();
        struct SharedSink(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        de.pull_stream("payload", SharedSink(sink_clone), move |bytes, done, _name| {
            decode_progress.lock().unwrap().push((bytes, done));
        });
    }

    // Feed the decoder in small fixed chunks, just like the 4 KiB buffer
    // used on the encoder side, to exercise cross-call resumption.
    let mut pos = 0;
    while pos < wire.len() {
        let end = (pos + 4096).min(wire.len());
        let n = de.run(&wire[pos .. end]).unwrap();
        pos += n;
        if de.is_idle() {
            break;
        }
    }
    assert!(de.is_idle());

    assert_eq!(*sink.lock().unwrap(), source);
    assert_eq!(decode_progress.lock().unwrap().last(), Some(&(100_000, true)));
}

//! §8 concrete scenario 5: two concrete types sharing a base registered in
//! a `TypeMap`, round-tripped through `push_polymorphic`/`pull_polymorphic`
//! as `Box<dyn Any + Send>`.

use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex};

use solidframe_core::config::Limits;
use solidframe_core::serialization::{Deserializer, Serializer, TypeMap};
use solidframe_core::SerializationError;

struct Apple {
    weight_grams: u32,
}

struct Orange {
    weight_grams: u32,
}

/// Marker type standing in for the common base `Apple`/`Orange` are declared
/// against; decode requests a pointer "as `Fruit`" the same way C++ callers
/// request a `shared_ptr<Fruit>` (§4.7, §4.8).
struct Fruit;

const APPLE_ID: u64 = 2;
const ORANGE_ID: u64 = 1;

fn fruit_type_map() -> TypeMap {
    let mut map = TypeMap::new();
    map.register_type::<Apple>(
        APPLE_ID,
        Arc::new(|v, ser| {
            let apple = v.downcast_ref::<Apple>().unwrap();
            ser.push_u32(apple.weight_grams);
        }),
        Arc::new(|blob: &[u8]| {
            let mut de = Deserializer::new(Limits::default());
            let weight = Arc::new(Mutex::new(0u32));
            {
                let weight = weight.clone();
                de.pull_u32(move |v| *weight.lock().unwrap() = v);
            }
            de.run(blob)?;
            Ok(Box::new(Apple {
                weight_grams: *weight.lock().unwrap(),
            }) as Box<dyn Any + Send>)
        }),
        Arc::new(|| Box::new(Apple { weight_grams: 0 }) as Box<dyn Any + Send>),
    );
    map.register_type::<Orange>(
        ORANGE_ID,
        Arc::new(|v, ser| {
            let orange = v.downcast_ref::<Orange>().unwrap();
            ser.push_u32(orange.weight_grams);
        }),
        Arc::new(|blob: &[u8]| {
            let mut de = Deserializer::new(Limits::default());
            let weight = Arc::new(Mutex::new(0u32));
            {
                let weight = weight.clone();
                de.pull_u32(move |v| *weight.lock().unwrap() = v);
            }
            de.run(blob)?;
            Ok(Box::new(Orange {
                weight_grams: *weight.lock().unwrap(),
            }) as Box<dyn Any + Send>)
        }),
        Arc::new(|| Box::new(Orange { weight_grams: 0 }) as Box<dyn Any + Send>),
    );
    map.register_cast::<Apple, Fruit>(Arc::new(|v| v));
    map.register_cast::<Orange, Fruit>(Arc::new(|v| v));
    map
}

#[test]
fn polymorphic_roundtrip_preserves_concrete_type_and_payload() {
    let map = Arc::new(fruit_type_map());

    let mut ser = Serializer::new(Limits::default());
    let apple: Box<dyn Any + Send> = Box::new(Apple { weight_grams: 150 });
    ser.push_polymorphic(&map, apple).unwrap();

    let mut buf = [0u8; 64];
    let n = ser.run(&mut buf).unwrap();
    assert!(ser.is_idle());

    let mut de = Deserializer::new(Limits::default());
    let result = Arc::new(Mutex::new(None));
    {
        let result = result.clone();
        de.pull_polymorphic(map.clone(), TypeId::of::<Fruit>(), move |r| {
            *result.lock().unwrap() = Some(r)
        });
    }
    de.run(&buf[.. n]).unwrap();
    assert!(de.is_idle());

    let decoded = result.lock().unwrap().take().unwrap().unwrap().unwrap();
    let apple = decoded.downcast_ref::<Apple>().expect("decoded value should be an Apple");
    assert_eq!(apple.weight_grams, 150);
    assert!(decoded.downcast_ref::<Orange>().is_none());
}

#[test]
fn polymorphic_null_id_decodes_to_none() {
    let mut map = fruit_type_map();
    map.set_null(0);
    let map = Arc::new(map);

    let mut buf = Vec::new();
    {
        let mut ser = Serializer::new(Limits::default());
        ser.push_u64(0); // the registered null id, with no following blob
        let mut chunk = [0u8; 16];
        loop {
            let n = ser.run(&mut chunk).unwrap();
            buf.extend_from_slice(&chunk[.. n]);
            if ser.is_idle() {
                break;
            }
        }
    }

    let mut de = Deserializer::new(Limits::default());
    let result = Arc::new(Mutex::new(None));
    {
        let result = result.clone();
        de.pull_polymorphic(map, TypeId::of::<Fruit>(), move |r| {
            *result.lock().unwrap() = Some(r)
        });
    }
    de.run(&buf).unwrap();
    assert!(de.is_idle());
    assert!(result.lock().unwrap().take().unwrap().unwrap().is_none());
}

/// A base the concrete type was never cast-registered against (§4.8) must
/// surface `NoCast` rather than silently handing back the concrete value.
#[test]
fn polymorphic_decode_without_a_registered_cast_is_no_cast() {
    struct Vegetable;

    let map = Arc::new(fruit_type_map());

    let mut ser = Serializer::new(Limits::default());
    let apple: Box<dyn Any + Send> = Box::new(Apple { weight_grams: 150 });
    ser.push_polymorphic(&map, apple).unwrap();
    let mut buf = [0u8; 64];
    let n = ser.run(&mut buf).unwrap();
    assert!(ser.is_idle());

    let mut de = Deserializer::new(Limits::default());
    let result = Arc::new(Mutex::new(None));
    {
        let result = result.clone();
        de.pull_polymorphic(map, TypeId::of::<Vegetable>(), move |r| {
            *result.lock().unwrap() = Some(r)
        });
    }
    de.run(&buf[.. n]).unwrap();
    assert!(de.is_idle());

    let err = result.lock().unwrap().take().unwrap().unwrap_err();
    assert_eq!(err, SerializationError::NoCast);
}

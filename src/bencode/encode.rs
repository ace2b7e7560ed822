use super::value::Value;

/// Encodes `value` canonically; dictionary keys come out in byte order.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

/// Appends the canonical encoding of `value` to `buf`.
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => write_bytes(b, buf),
        Value::List(list) => {
            buf.push(b'l');
            for item in list {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(dict) => {
            buf.push(b'd');
            for (key, val) in dict {
                write_bytes(key, buf);
                encode_into(val, buf);
            }
            buf.push(b'e');
        }
    }
}

fn write_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}

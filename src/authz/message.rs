//! Decoding of the message list carried in a `HAPROXY_NOTIFY` frame.

use crate::codec::value::{decode_kvs, decode_string, Value};

use super::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
	pub name: String,
	pub args: Vec<(String, Value)>,
}

impl Message {
	pub fn arg(&self, name: &str) -> Option<&Value> {
		self.args.iter().find(|(k, _)| k == name).map(|(_, v)| v)
	}
}

/// Decodes the sequence of messages carried in a NOTIFY frame's payload.
/// Each message is `{ name: string, nb_args: u8, args: K/V * nb_args }`.
pub fn decode_messages(buf: &[u8]) -> Result<Vec<Message>, Error> {
	let mut messages = Vec::new();
	let mut off = 0;

	while off < buf.len() {
		let (name, n) = decode_string(&buf[off..]).map_err(|e| {
			Error::Protocol(format!("notify: malformed message name: {e}"))
		})?;
		off += n;

		let nb_args = *buf
			.get(off)
			.ok_or_else(|| Error::Protocol("notify: truncated message header".to_string()))?
			as usize;
		off += 1;

		let (args, n) = decode_kvs(&buf[off..], Some(nb_args))
			.map_err(|e| Error::Protocol(format!("notify: malformed args: {e}")))?;
		off += n;

		messages.push(Message { name, args });
	}

	Ok(messages)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::value::encode_kv;

	#[test]
	fn decodes_a_single_message_with_one_arg() {
		let mut buf = Vec::new();
		crate::codec::value::encode_string_field(&mut buf, "check-intentions");
		buf.push(1);
		encode_kv(&mut buf, "cert", &Value::Binary(vec![1, 2, 3]));

		let messages = decode_messages(&buf).unwrap();
		assert_eq!(messages.len(), 1);
		assert_eq!(messages[0].name, "check-intentions");
		assert_eq!(messages[0].arg("cert"), Some(&Value::Binary(vec![1, 2, 3])));
	}

	#[test]
	fn decodes_multiple_messages_back_to_back() {
		let mut buf = Vec::new();
		crate::codec::value::encode_string_field(&mut buf, "a");
		buf.push(0);
		crate::codec::value::encode_string_field(&mut buf, "b");
		buf.push(0);

		let messages = decode_messages(&buf).unwrap();
		assert_eq!(messages.len(), 2);
		assert_eq!(messages[0].name, "a");
		assert_eq!(messages[1].name, "b");
	}
}

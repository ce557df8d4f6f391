//! Typed key/value pairs carried in NOTIFY messages and SET-VAR actions.

use std::net::{Ipv4Addr, Ipv6Addr};

use super::{varint, Error};

const TYPE_MASK: u8 = 0x0F;
const FLAG_TRUE: u8 = 0x10;

const TYPE_NULL: u8 = 0;
const TYPE_BOOL: u8 = 1;
const TYPE_INT32: u8 = 2;
const TYPE_UINT32: u8 = 3;
const TYPE_INT64: u8 = 4;
const TYPE_UINT64: u8 = 5;
const TYPE_IPV4: u8 = 6;
const TYPE_IPV6: u8 = 7;
const TYPE_STRING: u8 = 8;
const TYPE_BINARY: u8 = 9;

/// A single typed value, as carried in a K/V pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Null,
	Bool(bool),
	Int32(i32),
	UInt32(u32),
	Int64(i64),
	UInt64(u64),
	Ipv4(Ipv4Addr),
	Ipv6(Ipv6Addr),
	String(String),
	Binary(Vec<u8>),
}

impl Value {
	/// Convenience constructors used by the authorization agent when
	/// building SET-VAR actions.
	pub fn bool(v: bool) -> Self {
		Value::Bool(v)
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(v) => Some(*v),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::String(v) => Some(v.as_str()),
			_ => None,
		}
	}
}

fn encode_bytes(out: &mut Vec<u8>, v: &[u8]) {
	varint::encode(out, v.len() as u64);
	out.extend_from_slice(v);
}

/// Encodes a bare length-prefixed string (no type tag), as used by the
/// UNSET-VAR action, which carries only a variable name.
pub fn encode_string_field(out: &mut Vec<u8>, s: &str) {
	encode_bytes(out, s.as_bytes());
}

fn decode_bytes(buf: &[u8]) -> Result<(Vec<u8>, usize), Error> {
	let (len, off) = varint::decode(buf)?;
	let len = len as usize;
	let end = off.checked_add(len).ok_or(Error::UnexpectedEof)?;
	let data = buf.get(off..end).ok_or(Error::UnexpectedEof)?;
	Ok((data.to_vec(), end))
}

/// Decodes a bare length-prefixed string (no type tag), as used for
/// message names in NOTIFY frames and variable names in UNSET-VAR.
pub fn decode_string(buf: &[u8]) -> Result<(String, usize), Error> {
	let (bytes, n) = decode_bytes(buf)?;
	Ok((String::from_utf8(bytes).map_err(|e| e.utf8_error())?, n))
}

/// Encodes `name: value` as a K/V pair, appending to `out`.
pub fn encode_kv(out: &mut Vec<u8>, name: &str, value: &Value) {
	encode_bytes(out, name.as_bytes());
	match value {
		Value::Null => out.push(TYPE_NULL),
		Value::Bool(v) => {
			let mut tag = TYPE_BOOL;
			if *v {
				tag |= FLAG_TRUE;
			}
			out.push(tag);
		}
		Value::Int32(v) => {
			out.push(TYPE_INT32);
			varint::encode(out, *v as u64);
		}
		Value::UInt32(v) => {
			out.push(TYPE_UINT32);
			varint::encode(out, *v as u64);
		}
		Value::Int64(v) => {
			out.push(TYPE_INT64);
			varint::encode(out, *v as u64);
		}
		Value::UInt64(v) => {
			out.push(TYPE_UINT64);
			varint::encode(out, *v);
		}
		Value::Ipv4(ip) => {
			out.push(TYPE_IPV4);
			out.extend_from_slice(&ip.octets());
		}
		Value::Ipv6(ip) => {
			out.push(TYPE_IPV6);
			out.extend_from_slice(&ip.octets());
		}
		Value::String(v) => {
			out.push(TYPE_STRING);
			encode_bytes(out, v.as_bytes());
		}
		Value::Binary(v) => {
			out.push(TYPE_BINARY);
			encode_bytes(out, v);
		}
	}
}

/// Decodes a single K/V pair from the front of `buf`.
pub fn decode_kv(buf: &[u8]) -> Result<((String, Value), usize), Error> {
	let (name, mut off) = decode_string(buf)?;
	let tag = *buf.get(off).ok_or(Error::UnexpectedEof)?;
	let dtype = tag & TYPE_MASK;
	off += 1;

	let value = match dtype {
		TYPE_NULL => Value::Null,
		TYPE_BOOL => Value::Bool(tag & FLAG_TRUE > 0),
		TYPE_INT32 => {
			let (v, n) = varint::decode(&buf[off..])?;
			off += n;
			Value::Int32(v as i32)
		}
		TYPE_UINT32 => {
			let (v, n) = varint::decode(&buf[off..])?;
			off += n;
			Value::UInt32(v as u32)
		}
		TYPE_INT64 => {
			let (v, n) = varint::decode(&buf[off..])?;
			off += n;
			Value::Int64(v as i64)
		}
		TYPE_UINT64 => {
			let (v, n) = varint::decode(&buf[off..])?;
			off += n;
			Value::UInt64(v)
		}
		TYPE_IPV4 => {
			let bytes = buf.get(off..off + 4).ok_or(Error::InvalidIpLength(0))?;
			off += 4;
			Value::Ipv4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
		}
		TYPE_IPV6 => {
			let bytes: [u8; 16] = buf
				.get(off..off + 16)
				.ok_or(Error::InvalidIpLength(0))?
				.try_into()
				.map_err(|_| Error::InvalidIpLength(16))?;
			off += 16;
			Value::Ipv6(Ipv6Addr::from(bytes))
		}
		TYPE_STRING => {
			let (v, n) = decode_string(&buf[off..])?;
			off += n;
			Value::String(v)
		}
		TYPE_BINARY => {
			let (v, n) = decode_bytes(&buf[off..])?;
			off += n;
			Value::Binary(v)
		}
		other => return Err(Error::UnknownDataType(other)),
	};

	Ok(((name, value), off))
}

/// Decodes up to `count` K/V pairs (or all of them, if `count` is `None`)
/// from `buf`, returning them in wire order and the bytes consumed.
pub fn decode_kvs(buf: &[u8], count: Option<usize>) -> Result<(Vec<(String, Value)>, usize), Error> {
	let mut items = Vec::new();
	let mut off = 0;
	while off < buf.len() && count.map(|c| items.len() < c).unwrap_or(true) {
		let (kv, n) = decode_kv(&buf[off..])?;
		items.push(kv);
		off += n;
	}
	Ok((items, off))
}

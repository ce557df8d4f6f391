//! ACK-frame actions: SET-VAR and UNSET-VAR, as issued in response to a
//! `check-intentions` NOTIFY.

use crate::codec::value::{encode_kv, Value};

const ACTION_TYPE_SET_VAR: u8 = 1;
const ACTION_TYPE_UNSET_VAR: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
	Process = 0,
	Session = 1,
	Transaction = 2,
	Request = 3,
	Response = 4,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
	SetVar { name: String, scope: VarScope, value: Value },
	UnsetVar { name: String, scope: VarScope },
}

impl Action {
	/// Appends this action's wire encoding to `out`.
	pub fn encode(&self, out: &mut Vec<u8>) {
		match self {
			Action::SetVar { name, scope, value } => {
				out.push(ACTION_TYPE_SET_VAR);
				out.push(3);
				out.push(*scope as u8);
				encode_kv(out, name, value);
			}
			Action::UnsetVar { name, scope } => {
				out.push(ACTION_TYPE_UNSET_VAR);
				out.push(2);
				out.push(*scope as u8);
				crate::codec::value::encode_string_field(out, name);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_var_encodes_type_count_scope_then_kv() {
		let action = Action::SetVar {
			name: "auth".to_string(),
			scope: VarScope::Session,
			value: Value::Int32(1),
		};
		let mut buf = Vec::new();
		action.encode(&mut buf);
		assert_eq!(buf[0], ACTION_TYPE_SET_VAR);
		assert_eq!(buf[1], 3);
		assert_eq!(buf[2], VarScope::Session as u8);
	}

	#[test]
	fn unset_var_encodes_type_count_scope_then_name() {
		let action = Action::UnsetVar {
			name: "auth".to_string(),
			scope: VarScope::Session,
		};
		let mut buf = Vec::new();
		action.encode(&mut buf);
		assert_eq!(buf[0], ACTION_TYPE_UNSET_VAR);
		assert_eq!(buf[1], 2);
		assert_eq!(buf[2], VarScope::Session as u8);
	}
}

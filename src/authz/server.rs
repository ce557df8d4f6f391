//! The authorization callback server: accepts connections, negotiates
//! HELLO, and serves NOTIFY/DISCONNECT for the lifetime of the socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::codec::frame::{Frame, FrameFlags, FrameType, MAX_FRAME_SIZE};
use crate::codec::value::Value;

use super::action::{Action, VarScope};
use super::cache::{AuthzCache, CertCache};
use super::hello::{self, encode_payload};
use super::message::{decode_messages, Message};
use super::Error;

const ENGINE_ID_KEY: &str = "engine-id";

/// Extracted from a client certificate once, then cached by DER bytes.
#[derive(Clone)]
struct CertInfo {
	spiffe_uri: Arc<str>,
	serial_hex: Arc<str>,
}

/// Abstracts the upstream intention-authorization RPC so the server
/// doesn't depend on the mesh-agent HTTP client directly.
pub trait Authorizer: Send + Sync + 'static {
	fn authorize(
		&self,
		client_cert_uri: String,
		client_cert_serial: String,
	) -> BoxFuture<'static, Result<bool, Error>>;
}

/// Implements `check-intentions`: certificate parsing (cached), the
/// single-flight authorization cache, and source-app derivation.
pub struct CheckIntentionsHandler {
	cert_cache: CertCache<CertInfo>,
	authz_cache: AuthzCache,
	authorizer: Arc<dyn Authorizer>,
}

impl CheckIntentionsHandler {
	pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
		CheckIntentionsHandler {
			cert_cache: CertCache::new(2048, Duration::from_secs(60)),
			authz_cache: AuthzCache::new(Duration::from_secs(1), Duration::from_secs(1)),
			authorizer,
		}
	}

	#[instrument(level = "debug", skip_all)]
	async fn handle_check_intentions(&self, der: &[u8]) -> Result<Vec<Action>, Error> {
		let info = self
			.cert_cache
			.get_or_parse(der, parse_cert_info)
			.await
			.map_err(|e| Error::CertParse(e.to_string()))?;

		let source_app = derive_source_app(&info.spiffe_uri).unwrap_or_default();

		let authorizer = self.authorizer.clone();
		let uri = info.spiffe_uri.clone();
		let serial = info.serial_hex.clone();
		let authorized = self
			.authz_cache
			.lookup(&info.spiffe_uri, move || {
				Box::pin(async move { authorizer.authorize(uri.to_string(), serial.to_string()).await })
			})
			.await?;

		Ok(vec![
			Action::SetVar {
				name: "auth".to_string(),
				scope: VarScope::Session,
				value: Value::Int32(if authorized { 1 } else { 0 }),
			},
			Action::SetVar {
				name: "source_app".to_string(),
				scope: VarScope::Session,
				value: Value::String(source_app),
			},
		])
	}

	async fn handle(&self, messages: Vec<Message>) -> Result<Vec<Action>, Error> {
		for message in messages {
			if message.name != "check-intentions" {
				continue;
			}
			let der = match message.arg("cert") {
				Some(Value::Binary(bytes)) => bytes.clone(),
				_ => return Err(Error::Protocol("check-intentions: missing cert arg".to_string())),
			};
			return self.handle_check_intentions(&der).await;
		}
		Ok(Vec::new())
	}
}

fn parse_cert_info(der: &[u8]) -> Result<CertInfo, Error> {
	let (_, cert) = x509_parser::parse_x509_certificate(der)
		.map_err(|e| Error::CertParse(e.to_string()))?;

	let uri = cert
		.subject_alternative_name()
		.map_err(|e| Error::CertParse(e.to_string()))?
		.and_then(|ext| {
			ext.value.general_names.iter().find_map(|name| match name {
				x509_parser::extensions::GeneralName::URI(uri) => Some(uri.to_string()),
				_ => None,
			})
		})
		.ok_or_else(|| Error::CertParse("no URI SAN in certificate".to_string()))?;

	Ok(CertInfo {
		spiffe_uri: Arc::from(uri),
		serial_hex: Arc::from(hex::encode(cert.raw_serial())),
	})
}

/// SPIFFE URIs used by the mesh embed `/svc/<name>`; the segment after it
/// is the calling service's name ("source app").
fn derive_source_app(uri: &str) -> Option<String> {
	let parsed = url::Url::parse(uri).ok()?;
	let segments: Vec<&str> = parsed.path_segments()?.collect();
	segments
		.iter()
		.position(|s| *s == "svc")
		.and_then(|i| segments.get(i + 1))
		.map(|s| s.to_string())
}

struct EngineQueue {
	tx: mpsc::UnboundedSender<Frame>,
	rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

/// Reference-counted registry of per-engine ack queues, created lazily by
/// the first connection for an engine-id and torn down by the last.
pub struct EngineRegistry {
	queues: StdMutex<HashMap<String, Arc<EngineQueue>>>,
}

impl EngineRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(EngineRegistry {
			queues: StdMutex::new(HashMap::new()),
		})
	}

	fn acquire(self: &Arc<Self>, engine_id: &str) -> EngineHandle {
		let mut queues = self.queues.lock().unwrap();
		let queue = queues
			.entry(engine_id.to_string())
			.or_insert_with(|| {
				let (tx, rx) = mpsc::unbounded_channel();
				Arc::new(EngineQueue { tx, rx: Mutex::new(rx) })
			})
			.clone();
		EngineHandle {
			engine_id: engine_id.to_string(),
			registry: self.clone(),
			queue,
		}
	}
}

struct EngineHandle {
	engine_id: String,
	registry: Arc<EngineRegistry>,
	queue: Arc<EngineQueue>,
}

impl Drop for EngineHandle {
	fn drop(&mut self) {
		let mut queues = self.registry.queues.lock().unwrap();
		if let Some(entry) = queues.get(&self.engine_id) {
			// Two references remain right before this drop completes: the
			// map's own and this handle's `queue` field.
			if Arc::strong_count(entry) <= 2 {
				queues.remove(&self.engine_id);
			}
		}
	}
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, Error> {
	let mut len_buf = [0u8; 4];
	reader.read_exact(&mut len_buf).await?;
	let declared = u32::from_be_bytes(len_buf) as usize;
	if declared > MAX_FRAME_SIZE {
		return Err(crate::codec::Error::FrameTooLarge(declared).into());
	}
	let mut full = vec![0u8; 4 + declared];
	full[..4].copy_from_slice(&len_buf);
	reader.read_exact(&mut full[4..]).await?;
	let (frame, _) = Frame::decode(&full)?;
	Ok(frame)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), Error> {
	let mut buf = Vec::new();
	frame.encode(&mut buf)?;
	writer.write_all(&buf).await?;
	writer.flush().await?;
	Ok(())
}

fn disconnect_frame(stream_id: u64, frame_id: u64, status_code: u32, message: &str) -> Frame {
	let payload = encode_payload(&[
		("status-code".to_string(), Value::UInt32(status_code)),
		("message".to_string(), Value::String(message.to_string())),
	]);
	Frame {
		ftype: FrameType::AgentDisconnect,
		flags: FrameFlags::fin(),
		stream_id,
		frame_id,
		payload,
	}
}

/// Drives a single connection end to end: HELLO negotiation, then the
/// NOTIFY/DISCONNECT serving loop, until the peer disconnects or the
/// connection is aborted by a protocol violation.
#[instrument(level = "info", skip_all)]
pub async fn handle_connection<S>(
	stream: S,
	registry: Arc<EngineRegistry>,
	handler: Arc<CheckIntentionsHandler>,
) -> Result<(), Error>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (mut reader, mut writer) = tokio::io::split(stream);

	let hello_frame = read_frame(&mut reader).await?;
	if hello_frame.ftype != FrameType::HaproxyHello {
		return Err(Error::Protocol(format!(
			"expected HAPROXY_HELLO, got {:?}",
			hello_frame.ftype
		)));
	}

	let negotiation = hello::negotiate(&hello_frame.payload, MAX_FRAME_SIZE as u32);
	let (negotiated, reply_kvs, engine_id) = match negotiation {
		Ok((negotiated, reply_kvs)) => {
			let (kvs, _) = crate::codec::value::decode_kvs(&hello_frame.payload, None)?;
			let engine_id = kvs
				.iter()
				.find(|(k, _)| k == ENGINE_ID_KEY)
				.and_then(|(_, v)| v.as_str().map(str::to_string))
				.unwrap_or_else(|| format!("anon-{}", rand::random::<u64>()));
			(negotiated, reply_kvs, engine_id)
		}
		Err(e) => {
			let status = match &e {
				Error::UnsupportedVersion(_) => 1,
				Error::MissingCapability(_) => 2,
				_ => 255,
			};
			let frame = disconnect_frame(hello_frame.stream_id, hello_frame.frame_id, status, &e.to_string());
			let _ = write_frame(&mut writer, &frame).await;
			return Err(e);
		}
	};

	let hello_reply = Frame {
		ftype: FrameType::AgentHello,
		flags: FrameFlags::fin(),
		stream_id: hello_frame.stream_id,
		frame_id: hello_frame.frame_id,
		payload: encode_payload(&reply_kvs),
	};
	write_frame(&mut writer, &hello_reply).await?;

	if negotiated.healthcheck {
		debug!("healthcheck connection closing after hello");
		return Ok(());
	}

	let engine = registry.acquire(&engine_id);
	info!(engine_id = %engine_id, "connection ready for notify");

	loop {
		tokio::select! {
			incoming = read_frame(&mut reader) => {
				let frame = match incoming {
					Ok(frame) => frame,
					Err(e) => {
						warn!(error = %e, "connection closed on read error");
						return Err(e);
					}
				};
				match frame.ftype {
					FrameType::HaproxyNotify => {
						let handler = handler.clone();
						let tx = engine.queue.tx.clone();
						let stream_id = frame.stream_id;
						let frame_id = frame.frame_id;
						tokio::spawn(async move {
							let messages = match decode_messages(&frame.payload) {
								Ok(m) => m,
								Err(e) => {
									error!(error = %e, "malformed notify payload");
									return;
								}
							};
							let actions = match handler.handle(messages).await {
								Ok(actions) => actions,
								Err(e) => {
									error!(error = %e, "check-intentions failed");
									Vec::new()
								}
							};
							let mut payload = Vec::new();
							for action in &actions {
								action.encode(&mut payload);
							}
							let ack = Frame {
								ftype: FrameType::AgentAck,
								flags: FrameFlags::fin(),
								stream_id,
								frame_id,
								payload,
							};
							let _ = tx.send(ack);
						});
					}
					FrameType::HaproxyDisconnect => {
						debug!("peer disconnected cleanly");
						return Ok(());
					}
					other => {
						warn!(?other, "unhandled frame type, ignoring");
					}
				}
			}
			ack = recv_ack(&engine.queue) => {
				if let Some(frame) = ack {
					if let Err(e) = write_frame(&mut writer, &frame).await {
						warn!(error = %e, "failed writing ack frame");
					}
				}
			}
		}
	}
}

async fn recv_ack(queue: &EngineQueue) -> Option<Frame> {
	let mut rx = queue.rx.lock().await;
	rx.recv().await
}

/// Binds a Unix-domain socket and serves connections until the listener
/// is dropped or accept fails fatally.
pub async fn serve_unix(
	path: &std::path::Path,
	handler: Arc<CheckIntentionsHandler>,
) -> Result<(), Error> {
	if path.exists() {
		let _ = std::fs::remove_file(path);
	}
	let listener = UnixListener::bind(path)?;
	let registry = EngineRegistry::new();
	info!(path = %path.display(), "authorization agent listening");

	loop {
		let (stream, _) = listener.accept().await?;
		let registry = registry.clone();
		let handler = handler.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(stream, registry, handler).await {
				warn!(error = %e, "connection ended with error");
			}
		});
	}
}

#[derive(Clone)]
pub struct CallbackServer {
	pub handler: Arc<CheckIntentionsHandler>,
}

impl CallbackServer {
	pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
		CallbackServer {
			handler: Arc::new(CheckIntentionsHandler::new(authorizer)),
		}
	}

	pub async fn serve_unix(&self, path: &std::path::Path) -> Result<(), Error> {
		serve_unix(path, self.handler.clone()).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::value::encode_kv;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct AlwaysAuthorize(Arc<AtomicUsize>);

	impl Authorizer for AlwaysAuthorize {
		fn authorize(&self, _uri: String, _serial: String) -> BoxFuture<'static, Result<bool, Error>> {
			self.0.fetch_add(1, Ordering::SeqCst);
			Box::pin(async { Ok(true) })
		}
	}

	fn hello_payload() -> Vec<u8> {
		let mut buf = Vec::new();
		encode_kv(&mut buf, "max-frame-size", &Value::UInt32(8192));
		encode_kv(&mut buf, "supported-versions", &Value::String("2.0".to_string()));
		encode_kv(&mut buf, "capabilities", &Value::String("async,pipelining".to_string()));
		buf
	}

	#[tokio::test]
	async fn hello_then_healthcheck_closes_cleanly() {
		let (client, server) = tokio::io::duplex(64 * 1024);
		let registry = EngineRegistry::new();
		let calls = Arc::new(AtomicUsize::new(0));
		let handler = Arc::new(CheckIntentionsHandler::new(Arc::new(AlwaysAuthorize(calls))));

		let mut payload = hello_payload();
		let mut kv = Vec::new();
		encode_kv(&mut kv, "healthcheck", &Value::Bool(true));
		payload.extend_from_slice(&kv);

		let hello = Frame {
			ftype: FrameType::HaproxyHello,
			flags: FrameFlags::fin(),
			stream_id: 0,
			frame_id: 0,
			payload,
		};

		let (mut client_read, mut client_write) = tokio::io::split(client);
		let mut buf = Vec::new();
		hello.encode(&mut buf).unwrap();
		client_write.write_all(&buf).await.unwrap();

		let server_task = tokio::spawn(handle_connection(server, registry, handler));

		let reply = read_frame(&mut client_read).await.unwrap();
		assert_eq!(reply.ftype, FrameType::AgentHello);

		server_task.await.unwrap().unwrap();
	}
}

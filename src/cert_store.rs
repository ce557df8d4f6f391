//! Content-addressed on-disk materialization of PEM blobs (§4.D).
//!
//! A blob is written to `<base>/<hex-sha256(blob)>` exactly once; later
//! writes of equal content return the same path after a single `stat`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ring::digest::{Context, SHA256};

use crate::watch::desired::Tls;

#[derive(Debug, Clone)]
pub struct CertStore {
	base: PathBuf,
}

/// The two files a `Tls` bundle materializes to: the combined `cert‖key`
/// the data plane loads with `ssl crt`, and the CA chain it loads with
/// `ssl ca-file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
	pub cert_path: String,
	pub ca_path: String,
}

impl CertStore {
	pub fn new(base: impl Into<PathBuf>) -> io::Result<Self> {
		let base = base.into();
		fs::create_dir_all(&base)?;
		Ok(CertStore { base })
	}

	/// Writes `blob` under its content hash, skipping the write if the
	/// path already exists.
	pub fn write(&self, blob: &[u8]) -> io::Result<PathBuf> {
		let path = self.path_for(blob);
		if path.try_exists()? {
			return Ok(path);
		}
		let tmp = self.base.join(format!(".tmp-{}", digest_hex(blob)));
		fs::write(&tmp, blob)?;
		fs::rename(&tmp, &path)?;
		Ok(path)
	}

	fn path_for(&self, blob: &[u8]) -> PathBuf {
		self.base.join(digest_hex(blob))
	}

	/// Materializes a `Tls` struct's two files, returning their paths.
	pub fn materialize(&self, tls: &Tls) -> io::Result<TlsPaths> {
		let mut bundle = Vec::with_capacity(tls.cert_pem.len() + tls.key_pem.len());
		bundle.extend_from_slice(tls.cert_pem.as_bytes());
		bundle.extend_from_slice(tls.key_pem.as_bytes());
		let cert_path = self.write(&bundle)?;

		let mut chain = String::new();
		for pem in &tls.ca_pem_chain {
			chain.push_str(pem);
		}
		let ca_path = self.write(chain.as_bytes())?;

		Ok(TlsPaths {
			cert_path: path_to_string(&cert_path),
			ca_path: path_to_string(&ca_path),
		})
	}
}

fn path_to_string(p: &Path) -> String {
	p.to_string_lossy().into_owned()
}

fn digest_hex(blob: &[u8]) -> String {
	let mut ctx = Context::new(&SHA256);
	ctx.update(blob);
	hex::encode(ctx.finish().as_ref())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn writes_once_and_is_idempotent() {
		let dir = tempdir();
		let store = CertStore::new(&dir).unwrap();
		let path1 = store.write(b"hello").unwrap();
		let contents = fs::read(&path1).unwrap();
		assert_eq!(contents, b"hello");

		let path2 = store.write(b"hello").unwrap();
		assert_eq!(path1, path2);

		fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn different_content_different_path() {
		let dir = tempdir();
		let store = CertStore::new(&dir).unwrap();
		let a = store.write(b"a").unwrap();
		let b = store.write(b"b").unwrap();
		assert_ne!(a, b);
		fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn materialize_concatenates_cert_and_key() {
		let dir = tempdir();
		let store = CertStore::new(&dir).unwrap();
		let tls = Tls {
			ca_pem_chain: vec!["CA1".into(), "CA2".into()],
			cert_pem: "CERT".into(),
			key_pem: "KEY".into(),
		};
		let paths = store.materialize(&tls).unwrap();
		assert_eq!(fs::read_to_string(&paths.cert_path).unwrap(), "CERTKEY");
		assert_eq!(fs::read_to_string(&paths.ca_path).unwrap(), "CA1CA2");
		fs::remove_dir_all(&dir).ok();
	}

	fn tempdir() -> PathBuf {
		let mut dir = std::env::temp_dir();
		dir.push(format!("connect-sidecar-test-{}", std::process::id()));
		dir.push(unique_suffix());
		dir
	}

	fn unique_suffix() -> String {
		use std::sync::atomic::{AtomicU64, Ordering};
		static COUNTER: AtomicU64 = AtomicU64::new(0);
		format!("{}", COUNTER.fetch_add(1, Ordering::Relaxed))
	}
}

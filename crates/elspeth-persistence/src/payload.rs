//! Payload store en filesystem, direccionado por contenido.
//!
//! Layout: `store/<hash[:2]>/<hash>`. Write-once: el archivo se escribe a un
//! temporal y se renombra; escritores concurrentes del mismo hash son
//! idempotentes (el rename que pierde encuentra el destino ya existente con
//! el mismo contenido).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use elspeth_core::errors::RecorderError;
use elspeth_core::hashing::payload_address;
use elspeth_core::landscape::PayloadStore;
use uuid::Uuid;

pub struct FsPayloadStore {
    root: PathBuf,
}

impl FsPayloadStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| RecorderError::Storage(format!("create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        let prefix = &hash[..2.min(hash.len())];
        self.root.join(prefix).join(hash)
    }
}

impl PayloadStore for FsPayloadStore {
    fn put_bytes(&self, bytes: &[u8]) -> Result<String, RecorderError> {
        let hash = payload_address(bytes);
        let path = self.path_for(&hash);
        if path.exists() {
            return Ok(hash);
        }
        let dir = path.parent().expect("payload path has parent");
        fs::create_dir_all(dir).map_err(|e| RecorderError::Storage(format!("create {}: {e}", dir.display())))?;

        // Escritura a temporal + rename: nunca se observa un blob a medias.
        let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        {
            let mut file =
                fs::File::create(&tmp).map_err(|e| RecorderError::Storage(format!("create {}: {e}", tmp.display())))?;
            file.write_all(bytes)
                .map_err(|e| RecorderError::Storage(format!("write {}: {e}", tmp.display())))?;
        }
        match fs::rename(&tmp, &path) {
            Ok(()) => Ok(hash),
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                if path.exists() {
                    // Otro escritor ganó la carrera con el mismo contenido.
                    Ok(hash)
                } else {
                    Err(RecorderError::Storage(format!("rename {}: {e}", path.display())))
                }
            }
        }
    }

    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, RecorderError> {
        let path = self.path_for(hash);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RecorderError::Storage(format!("read {}: {e}", path.display()))),
        }
    }
}

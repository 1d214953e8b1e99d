use std::fs;
use std::io::Write;
use std::path::Path;

use arbor_hash::hasher::Hasher;
use arbor_hash::ObjectId;
use arbor_object::{header, Object, ObjectType};
use flate2::write::ZlibEncoder;

use crate::{ObjectStore, OdbError};

impl ObjectStore {
    /// Write an object to the store. Returns its OID.
    ///
    /// No-op if the object already exists (content-addressed idempotency).
    pub fn write(&self, obj: &Object) -> Result<ObjectId, OdbError> {
        let content = obj.serialize_content();
        self.write_raw(obj.object_type(), &content)
    }

    /// Write raw content with a known type. Returns the OID.
    pub fn write_raw(&self, obj_type: ObjectType, content: &[u8]) -> Result<ObjectId, OdbError> {
        let hdr = header::write_header(obj_type, content.len());

        // The OID covers the uncompressed header + content.
        let oid = {
            let mut hasher = Hasher::new(self.hash_algo());
            hasher.update(&hdr);
            hasher.update(content);
            hasher.finalize()?
        };

        if self.contains(&oid) {
            return Ok(oid);
        }

        let final_path = self.object_path(&oid);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = write_to_temp(
            self.objects_dir(),
            &hdr,
            content,
            self.compression_level(),
        )?;
        finalize_object(&tmp_path, &final_path)?;

        Ok(oid)
    }

    /// Write from a reader with a declared size. Returns the OID.
    pub fn write_stream(
        &self,
        obj_type: ObjectType,
        size: usize,
        reader: &mut dyn std::io::Read,
    ) -> Result<ObjectId, OdbError> {
        let mut content = Vec::with_capacity(size);
        reader.read_to_end(&mut content)?;

        if content.len() != size {
            return Err(OdbError::Corrupt {
                oid: String::new(),
                reason: format!(
                    "stream size mismatch: declared {}, got {}",
                    size,
                    content.len()
                ),
            });
        }

        self.write_raw(obj_type, &content)
    }

    fn compression_level(&self) -> flate2::Compression {
        self.compression_level
    }
}

/// Compress header + content into a temp file under `objects_dir`.
fn write_to_temp(
    objects_dir: &Path,
    hdr: &[u8],
    content: &[u8],
    level: flate2::Compression,
) -> Result<std::path::PathBuf, OdbError> {
    let tmp_path = objects_dir.join(format!(
        "tmp_obj_{}",
        std::process::id()
            ^ std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos()
    ));

    let file = fs::File::create(&tmp_path)?;
    let mut encoder = ZlibEncoder::new(file, level);
    encoder.write_all(hdr)?;
    encoder.write_all(content)?;
    encoder.finish()?;

    Ok(tmp_path)
}

/// Atomically move a temp file to its final destination.
///
/// A rename that fails because another writer already produced the object is
/// treated as success.
fn finalize_object(tmp: &Path, final_path: &Path) -> Result<(), OdbError> {
    match fs::rename(tmp, final_path) {
        Ok(()) => Ok(()),
        Err(_) if final_path.exists() => {
            let _ = fs::remove_file(tmp);
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(tmp);
            Err(OdbError::Io(e))
        }
    }
}

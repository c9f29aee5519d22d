//! Binary payloads: images, documents and other files

use super::{content_hash, Analysis};
use crate::crawler::Target;
use crate::sink::SinkPack;

/// Wraps the payload into one file record per object output of the target
pub(crate) fn analyze(target: &Target, bytes: &[u8], ext: &str) -> Analysis {
    let hash = target.fingerprint();
    let packs = target
        .template
        .object_outputs
        .iter()
        .map(|output| SinkPack::file(&output.name, &target.url, &hash, bytes.to_vec(), ext))
        .collect();

    Analysis {
        mtag: content_hash(bytes),
        targets: Vec::new(),
        files: Vec::new(),
        packs,
    }
}

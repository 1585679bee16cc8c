/// Work templates fetched from the daemon and the per-session jobs built from them

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::nonce::{self, NoncePartition};

/// Offset of the nonce inside the hashing blob when the daemon omits it.
pub const DEFAULT_NONCE_OFFSET: usize = 39;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTemplate {
    /// Hashing blob (hex)
    pub blob: String,
    pub difficulty: u64,
    pub height: u64,
    pub prev_hash: String,
    pub nonce_offset: usize,
}

impl BlockTemplate {
    /// Parse a `get_block_template` result.
    pub fn from_rpc_response(value: &Value) -> Result<Self> {
        let blob = value
            .get("blob")
            .or_else(|| value.get("blockhashing_blob"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("template has no blob"))?
            .trim_start_matches("0x")
            .to_lowercase();

        let nonce_offset = match value.get("nonce_offset").and_then(|v| v.as_u64()) {
            Some(raw) => usize::try_from(raw).map_err(|_| anyhow!("nonce offset {} out of range", raw))?,
            None => DEFAULT_NONCE_OFFSET,
        };

        let template = Self {
            blob,
            difficulty: value
                .get("difficulty")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            height: value.get("height").and_then(|v| v.as_u64()).unwrap_or(0),
            prev_hash: value
                .get("prev_hash")
                .or_else(|| value.get("prevhash"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            nonce_offset,
        };
        template.validate()?;
        Ok(template)
    }

    fn validate(&self) -> Result<()> {
        if self.difficulty == 0 {
            return Err(anyhow!("template difficulty is zero"));
        }
        let bytes = self.blob.len() / 2;
        if self.blob.len() % 2 != 0 || !self.blob.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow!("template blob is not hex"));
        }
        let nonce_end = self
            .nonce_offset
            .checked_add(nonce::NONCE_SIZE)
            .ok_or_else(|| anyhow!("nonce offset {} out of range", self.nonce_offset))?;
        if bytes < nonce_end {
            return Err(anyhow!(
                "template blob ({} bytes) too short for nonce at offset {}",
                bytes,
                self.nonce_offset
            ));
        }
        Ok(())
    }

    /// Same height, previous hash and blob: nothing new to fan out.
    pub fn same_work(&self, other: &BlockTemplate) -> bool {
        self.height == other.height && self.prev_hash == other.prev_hash && self.blob == other.blob
    }
}

/// A template published by the registry under a sequence number.
#[derive(Debug, Clone)]
pub struct WorkTemplate {
    pub seq: u64,
    pub template: BlockTemplate,
    blob: Vec<u8>,
}

impl WorkTemplate {
    pub fn new(seq: u64, template: BlockTemplate) -> Result<Self> {
        template.validate()?;
        let blob = hex::decode(&template.blob)?;
        Ok(Self { seq, template, blob })
    }

    pub fn height(&self) -> u64 {
        self.template.height
    }

    pub fn job_id(&self) -> String {
        format!("{}-{}", self.seq, self.template.height)
    }

    /// XMRig-style 64-bit target, little-endian hex.
    pub fn target_hex(&self) -> String {
        let target = u64::MAX / self.template.difficulty.max(1);
        hex::encode(target.to_le_bytes())
    }

    /// Raw blob with the session's partition start written into the nonce field.
    pub fn blob_for(&self, partition: Option<NoncePartition>) -> Vec<u8> {
        let mut blob = self.blob.clone();
        if let Some(p) = partition {
            nonce::write_nonce(&mut blob, self.template.nonce_offset, p.start());
        }
        blob
    }

    /// Blob with the upstream nonce filled in, as submitted to the daemon.
    pub fn solved_blob(&self, nonce: u32) -> String {
        let mut blob = self.blob.clone();
        nonce::write_nonce(&mut blob, self.template.nonce_offset, nonce);
        hex::encode(blob)
    }

    pub fn job_for(&self, partition: Option<NoncePartition>) -> Job {
        Job {
            job_id: self.job_id(),
            blob: hex::encode(self.blob_for(partition)),
            target: self.target_hex(),
            difficulty: self.template.difficulty,
            height: self.template.height,
        }
    }
}

/// Split `<seq>-<height>` back into its parts.
pub fn parse_job_id(job_id: &str) -> Option<(u64, u64)> {
    let (seq, height) = job_id.trim().split_once('-')?;
    Some((seq.parse().ok()?, height.parse().ok()?))
}

/// Job as pushed to a miner (XMRig `job` params).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub blob: String,
    pub target: String,
    pub difficulty: u64,
    pub height: u64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// 76-byte blob, nonce at the default offset.
    pub(crate) fn sample_template(height: u64) -> BlockTemplate {
        BlockTemplate {
            blob: format!("{:02x}", height as u8).repeat(76),
            difficulty: 1000,
            height,
            prev_hash: format!("prev{}", height),
            nonce_offset: DEFAULT_NONCE_OFFSET,
        }
    }

    #[test]
    fn test_from_rpc_response() {
        let value = json!({
            "blob": "00".repeat(76),
            "difficulty": 5000,
            "height": 42,
            "prev_hash": "abcd",
        });
        let template = BlockTemplate::from_rpc_response(&value).unwrap();
        assert_eq!(template.height, 42);
        assert_eq!(template.difficulty, 5000);
        assert_eq!(template.nonce_offset, DEFAULT_NONCE_OFFSET);

        assert!(BlockTemplate::from_rpc_response(&json!({"difficulty": 1})).is_err());
        assert!(BlockTemplate::from_rpc_response(&json!({"blob": "00", "difficulty": 1})).is_err());
        assert!(BlockTemplate::from_rpc_response(&json!({"blob": "00".repeat(76)})).is_err());
    }

    #[test]
    fn test_rejects_nonce_offset_past_blob() {
        let huge = json!({"blob": "00".repeat(76), "difficulty": 1, "nonce_offset": u64::MAX});
        assert!(BlockTemplate::from_rpc_response(&huge).is_err());

        let at_end = json!({"blob": "00".repeat(76), "difficulty": 1, "nonce_offset": 73});
        assert!(BlockTemplate::from_rpc_response(&at_end).is_err());

        let mut template = sample_template(1);
        template.nonce_offset = usize::MAX - 1;
        assert!(WorkTemplate::new(1, template).is_err());
    }

    #[test]
    fn test_same_work() {
        let a = sample_template(10);
        let mut b = a.clone();
        assert!(a.same_work(&b));
        b.difficulty = 1;
        assert!(a.same_work(&b));
        b.prev_hash = "other".into();
        assert!(!a.same_work(&b));
    }

    #[test]
    fn test_job_for_partition_writes_prefix() {
        let work = WorkTemplate::new(3, sample_template(7)).unwrap();
        assert_eq!(work.job_id(), "3-7");
        assert_eq!(parse_job_id("3-7"), Some((3, 7)));
        assert_eq!(parse_job_id("x-7"), None);

        let shared = work.job_for(None);
        assert_eq!(shared.blob, work.template.blob);

        let job = work.job_for(Some(NoncePartition::new(2, 8)));
        let blob = hex::decode(&job.blob).unwrap();
        let off = DEFAULT_NONCE_OFFSET;
        assert_eq!(&blob[off..off + 4], &[0, 0, 0, 2]);
        assert_eq!(job.target, hex::encode((u64::MAX / 1000).to_le_bytes()));
    }

    #[test]
    fn test_solved_blob() {
        let work = WorkTemplate::new(1, sample_template(0)).unwrap();
        let solved = hex::decode(work.solved_blob(0x0201_0000)).unwrap();
        let off = DEFAULT_NONCE_OFFSET;
        assert_eq!(&solved[off..off + 4], &[0, 0, 1, 2]);
    }
}

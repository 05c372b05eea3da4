//! Concurrency budget resolution and file partitioning.

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

/// Reads the concurrency an account is allowed to use.
#[async_trait]
pub trait CcyReader: Send + Sync {
    async fn read_allowed_ccy(&self) -> anyhow::Result<usize>;
}

/// A reader with a fixed allowance. Used by backends without an account
/// quota (the container backend) and by tests.
pub struct StaticCcyReader {
    allowed: usize,
}

impl StaticCcyReader {
    pub fn new(allowed: usize) -> Self {
        Self { allowed }
    }
}

#[async_trait]
impl CcyReader for StaticCcyReader {
    async fn read_allowed_ccy(&self) -> anyhow::Result<usize> {
        Ok(self.allowed)
    }
}

/// Resolves the effective concurrency: `min(requested, allowed)`.
///
/// A failed quota read is a fatal setup error; it aborts the run before any
/// suite starts.
pub async fn effective(reader: &dyn CcyReader, requested: usize) -> anyhow::Result<usize> {
    let allowed = reader
        .read_allowed_ccy()
        .await
        .context("failed to read allowed concurrency")?;

    if requested > allowed {
        info!(
            requested,
            allowed, "requested concurrency exceeds account allowance, lowering"
        );
        return Ok(allowed.max(1));
    }

    Ok(requested.max(1))
}

/// Partitions `files` into at most `count` contiguous buckets.
///
/// Every file lands in exactly one bucket and no bucket is empty; when the
/// split is uneven, the later buckets take the surplus. With fewer files
/// than buckets, each file gets its own bucket.
pub fn bin_pack<T: Clone>(files: &[T], count: usize) -> Vec<Vec<T>> {
    if files.is_empty() || count == 0 {
        return Vec::new();
    }

    let count = count.min(files.len());
    let base = files.len() / count;
    let remainder = files.len() % count;

    let mut buckets = Vec::with_capacity(count);
    let mut offset = 0;
    for i in 0..count {
        // The last `remainder` buckets take one extra file each.
        let size = base + usize::from(i >= count - remainder);
        buckets.push(files[offset..offset + size].to_vec());
        offset += size;
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingReader;

    #[async_trait]
    impl CcyReader for FailingReader {
        async fn read_allowed_ccy(&self) -> anyhow::Result<usize> {
            anyhow::bail!("quota service unavailable")
        }
    }

    #[tokio::test]
    async fn effective_below_allowance() {
        let reader = StaticCcyReader::new(10);
        assert_eq!(effective(&reader, 5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn effective_at_allowance() {
        let reader = StaticCcyReader::new(10);
        assert_eq!(effective(&reader, 10).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn effective_above_allowance() {
        let reader = StaticCcyReader::new(10);
        assert_eq!(effective(&reader, 20).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn effective_read_failure_is_fatal() {
        assert!(effective(&FailingReader, 20).await.is_err());
    }

    fn files(n: usize) -> Vec<String> {
        (1..=n).map(|i| i.to_string()).collect()
    }

    #[test]
    fn bin_pack_single_bucket() {
        assert_eq!(bin_pack(&files(3), 1), vec![files(3)]);
    }

    #[test]
    fn bin_pack_uneven_split_fills_later_buckets() {
        assert_eq!(
            bin_pack(&files(3), 2),
            vec![vec!["1".to_string()], vec!["2".to_string(), "3".to_string()]]
        );
    }

    #[test]
    fn bin_pack_even_split() {
        assert_eq!(
            bin_pack(&files(3), 3),
            vec![
                vec!["1".to_string()],
                vec!["2".to_string()],
                vec!["3".to_string()]
            ]
        );
    }

    #[test]
    fn bin_pack_more_buckets_than_files() {
        assert_eq!(bin_pack(&files(3), 5).len(), 3);
    }

    #[test]
    fn bin_pack_partitions_exactly() {
        let input = files(17);
        let buckets = bin_pack(&input, 5);
        let total: usize = buckets.iter().map(Vec::len).sum();
        assert_eq!(total, 17);
        assert!(buckets.iter().all(|b| !b.is_empty()));

        let mut flattened: Vec<String> = buckets.concat();
        flattened.sort();
        let mut want = input.clone();
        want.sort();
        assert_eq!(flattened, want);
    }
}

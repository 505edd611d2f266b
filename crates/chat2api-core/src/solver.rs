use async_trait::async_trait;

use crate::error::CoreResult;

/// External proof-of-work hashing capability.
///
/// The actual digest implementation (typically a wasm module shipped by the
/// upstream) lives outside this crate; the pipeline only ever asks for an
/// answer to a challenge it has already fetched.
#[async_trait]
pub trait PowSolver: Send + Sync {
    /// Loads the hashing resource. Called once by the embedder at startup.
    async fn init(&self, resource_path: &str) -> CoreResult<()>;

    async fn calculate_hash(
        &self,
        algorithm: &str,
        challenge: &str,
        salt: &str,
        difficulty: i64,
        expire_at: i64,
    ) -> CoreResult<i64>;
}

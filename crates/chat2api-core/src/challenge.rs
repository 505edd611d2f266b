//! Proof-of-work challenge handshake.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::solver::PowSolver;

/// Single-use challenge as issued by the upstream. Never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    pub algorithm: String,
    pub challenge: String,
    pub salt: String,
    pub difficulty: i64,
    pub expire_at: i64,
    pub signature: String,
}

// Serialized field order is the wire contract for the answer header.
#[derive(Debug, Serialize)]
struct Answer {
    algorithm: String,
    challenge: String,
    salt: String,
    answer: i64,
    signature: String,
    target_path: String,
}

/// Computes the answer and packages it for the one request it rides on.
///
/// The returned value goes into a single header of the very next outbound
/// call; answers are not reusable, so a retry always fetches a fresh
/// challenge first.
pub async fn solve(
    solver: &dyn PowSolver,
    resource_path: &str,
    challenge: Challenge,
    target_path: &str,
) -> CoreResult<String> {
    solver
        .init(resource_path)
        .await
        .map_err(|err| CoreError::Challenge(err.to_string()))?;
    let answer = solver
        .calculate_hash(
            &challenge.algorithm,
            &challenge.challenge,
            &challenge.salt,
            challenge.difficulty,
            challenge.expire_at,
        )
        .await
        .map_err(|err| CoreError::Challenge(err.to_string()))?;

    let answer = Answer {
        algorithm: challenge.algorithm,
        challenge: challenge.challenge,
        salt: challenge.salt,
        answer,
        signature: challenge.signature,
        target_path: target_path.to_string(),
    };
    let json =
        serde_json::to_vec(&answer).map_err(|err| CoreError::Challenge(err.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedSolver(i64);

    #[async_trait]
    impl PowSolver for FixedSolver {
        async fn init(&self, _resource_path: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn calculate_hash(
            &self,
            _algorithm: &str,
            _challenge: &str,
            _salt: &str,
            _difficulty: i64,
            _expire_at: i64,
        ) -> CoreResult<i64> {
            Ok(self.0)
        }
    }

    struct FailingSolver;

    #[async_trait]
    impl PowSolver for FailingSolver {
        async fn init(&self, _resource_path: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn calculate_hash(
            &self,
            _algorithm: &str,
            _challenge: &str,
            _salt: &str,
            _difficulty: i64,
            _expire_at: i64,
        ) -> CoreResult<i64> {
            Err(CoreError::Challenge("wasm digest failed".to_string()))
        }
    }

    fn sample_challenge() -> Challenge {
        Challenge {
            algorithm: "DeepSeekHashV1".to_string(),
            challenge: "c0ffee".to_string(),
            salt: "s4lt".to_string(),
            difficulty: 144_000,
            expire_at: 1_700_000_900,
            signature: "sig".to_string(),
        }
    }

    #[tokio::test]
    async fn answer_header_is_base64_json_in_wire_order() {
        let header = solve(
            &FixedSolver(42),
            "./pow.wasm",
            sample_challenge(),
            "/api/v0/chat/completion",
        )
        .await
        .unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(header)
            .unwrap();
        let json = String::from_utf8(decoded).unwrap();
        assert_eq!(
            json,
            "{\"algorithm\":\"DeepSeekHashV1\",\"challenge\":\"c0ffee\",\"salt\":\"s4lt\",\
             \"answer\":42,\"signature\":\"sig\",\"target_path\":\"/api/v0/chat/completion\"}"
        );
    }

    #[tokio::test]
    async fn solver_failure_maps_to_challenge_error() {
        let err = solve(&FailingSolver, "./pow.wasm", sample_challenge(), "/x")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Challenge(_)));
    }
}

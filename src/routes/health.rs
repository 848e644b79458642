//! Health check endpoint for container orchestration.

/// Liveness probe: 200 OK while the process can answer HTTP.
pub async fn health() -> &'static str {
    "ok"
}

use crate::storage::{DEFAULT_CLEANUP_THRESHOLD, DEFAULT_HARD_CAP_BYTES};
use clap::Parser;
use std::time::Duration;

// Command line of the gateway binary, every option can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "analysis-gateway")]
#[command(about = "Authenticated, rate limited analysis endpoint in front of a completion API")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "ANALYZE_PORT", default_value_t = 8080)]
    pub port: u16,

    // Accepted bearer tokens as comma separated <subject>:<token> pairs
    #[arg(long, env = "ANALYZE_TOKENS", hide_env_values = true)]
    pub tokens: String,

    // Completion API base url
    #[arg(long, env = "ANALYZE_UPSTREAM_URL", default_value = crate::completion::DEFAULT_BASE_URL)]
    pub upstream_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "ANALYZE_MODEL", default_value = crate::completion::DEFAULT_MODEL)]
    pub model: String,

    // Instructions sent ahead of every prompt
    #[arg(long, env = "ANALYZE_SYSTEM_PROMPT")]
    pub system_prompt: Option<String>,

    // Downstream request timeout in seconds, 0 disables it
    #[arg(long, env = "ANALYZE_UPSTREAM_TIMEOUT", default_value_t = 60)]
    pub upstream_timeout: u64,

    // Rate limit max requests per window
    #[arg(long, env = "ANALYZE_RATE_LIMIT", default_value_t = 10)]
    pub rate_limit: u64,

    // Rate limit window in seconds
    #[arg(long, env = "ANALYZE_RATE_WINDOW", default_value_t = 3600)]
    pub rate_window: u64,

    // History storage hard cap in bytes
    #[arg(long, env = "ANALYZE_HISTORY_CAP", default_value_t = DEFAULT_HARD_CAP_BYTES)]
    pub history_cap: u64,

    // Fraction of the cap at which old history is evicted
    #[arg(
        long,
        env = "ANALYZE_CLEANUP_THRESHOLD",
        default_value_t = DEFAULT_CLEANUP_THRESHOLD,
        value_parser = parse_threshold
    )]
    pub cleanup_threshold: f64,
}

impl Args {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window)
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        (self.upstream_timeout > 0).then(|| Duration::from_secs(self.upstream_timeout))
    }
}

fn parse_threshold(value: &str) -> Result<f64, String> {
    let threshold: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if threshold > 0.0 && threshold <= 1.0 {
        Ok(threshold)
    } else {
        Err(format!("{threshold} is not in (0, 1]"))
    }
}

//! Synthetic load driver for a tollgate cluster.
//!
//! Fires randomized chat-completion requests at one or more admission nodes
//! and reports outcome counts, token totals and latency percentiles.
//!
//! ```text
//! LOADTEST_URLS=http://localhost:8080,http://localhost:8081 \
//! LOADTEST_KEYS=test-key-1,test-key-2 \
//! LOADTEST_REQUESTS=500 LOADTEST_CONCURRENCY=20 cargo run -p loadtest
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;

use tollgate_shared::chat::ChatCompletionResponse;

const MESSAGE_TEMPLATES: [&str; 8] = [
    "Tell me an interesting fact about artificial intelligence.",
    "How should I approach learning a new programming language?",
    "Explain what machine learning is in one paragraph.",
    "Write a short story about future technology.",
    "What is the difference between Python and JavaScript?",
    "How can I improve my productivity at work?",
    "Explain how blockchains reach consensus.",
    "Recommend some books about distributed systems.",
];

const MODELS: [&str; 3] = ["gpt-3.5-turbo", "gpt-4", "gpt-4-turbo"];

#[derive(Debug, Clone)]
struct Config {
    urls: Vec<String>,
    keys: Vec<String>,
    requests: usize,
    concurrency: usize,
}

impl Config {
    fn from_env() -> Self {
        let list = |name: &str, default: &str| -> Vec<String> {
            std::env::var(name)
                .unwrap_or_else(|_| default.to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            urls: list("LOADTEST_URLS", "http://localhost:8080"),
            keys: list("LOADTEST_KEYS", "test-key-1"),
            requests: std::env::var("LOADTEST_REQUESTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(200),
            concurrency: std::env::var("LOADTEST_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    total: usize,
    ok: usize,
    rate_limited: usize,
    failed: usize,
    input_tokens: u64,
    output_tokens: u64,
    latencies_ms: Vec<u64>,
}

impl Stats {
    fn record_latency(&mut self, elapsed: Duration) {
        self.latencies_ms.push(elapsed.as_millis() as u64);
    }

    fn percentile(&self, sorted: &[u64], p: f64) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        let rank = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[rank]
    }

    fn print_summary(&self, elapsed: Duration) {
        let mut sorted = self.latencies_ms.clone();
        sorted.sort_unstable();

        let secs = elapsed.as_secs_f64();
        println!("---- load test summary ----");
        println!("duration            {secs:.1}s");
        println!("total requests      {}", self.total);
        println!(
            "successful          {} ({:.1}%)",
            self.ok,
            pct(self.ok, self.total)
        );
        println!(
            "rate limited        {} ({:.1}%)",
            self.rate_limited,
            pct(self.rate_limited, self.total)
        );
        println!("failed              {}", self.failed);
        println!("requests/second     {:.1}", self.total as f64 / secs.max(0.001));
        println!("input tokens        {}", self.input_tokens);
        println!("output tokens       {}", self.output_tokens);
        println!(
            "latency ms p50/p95/p99  {}/{}/{}",
            self.percentile(&sorted, 0.50),
            self.percentile(&sorted, 0.95),
            self.percentile(&sorted, 0.99),
        );
    }
}

fn pct(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn random_request() -> serde_json::Value {
    let mut rng = rand::thread_rng();

    let mut messages = Vec::new();
    let count = rng.gen_range(1..=3);
    for i in 0..count {
        let role = if i % 2 == 0 { "user" } else { "assistant" };
        let mut content = (*MESSAGE_TEMPLATES.choose(&mut rng).unwrap()).to_string();
        if rng.gen_bool(0.3) {
            let filler = " Here is some additional padding content.";
            content.push_str(&filler.repeat(rng.gen_range(5..20)));
        }
        messages.push(serde_json::json!({"role": role, "content": content}));
    }
    if messages.last().and_then(|m| m["role"].as_str()) != Some("user") {
        messages.push(serde_json::json!({
            "role": "user",
            "content": MESSAGE_TEMPLATES.choose(&mut rng).unwrap(),
        }));
    }

    let mut request = serde_json::json!({
        "model": MODELS.choose(&mut rng).unwrap(),
        "messages": messages,
        "temperature": rng.gen_range(0.5..1.0),
    });
    if let Some(max_tokens) = [None, Some(100), Some(500), Some(1000), Some(2000)]
        .choose(&mut rng)
        .copied()
        .flatten()
    {
        request["max_tokens"] = max_tokens.into();
    }
    request
}

async fn worker(
    http: reqwest::Client,
    config: Arc<Config>,
    stats: Arc<Mutex<Stats>>,
    quota: Arc<Mutex<usize>>,
) {
    loop {
        {
            let mut remaining = quota.lock().await;
            if *remaining == 0 {
                return;
            }
            *remaining -= 1;
        }

        let (url, key, body) = {
            let mut rng = rand::thread_rng();
            (
                config.urls.choose(&mut rng).unwrap().clone(),
                config.keys.choose(&mut rng).unwrap().clone(),
                random_request(),
            )
        };

        let started = Instant::now();
        let outcome = http
            .post(format!("{}/v1/chat/completions", url.trim_end_matches('/')))
            .bearer_auth(&key)
            .json(&body)
            .send()
            .await;
        let elapsed = started.elapsed();

        let mut stats = stats.lock().await;
        stats.total += 1;
        stats.record_latency(elapsed);
        match outcome {
            Ok(response) if response.status().is_success() => {
                stats.ok += 1;
                if let Ok(completion) = response.json::<ChatCompletionResponse>().await {
                    stats.input_tokens += completion.usage.prompt_tokens;
                    stats.output_tokens += completion.usage.completion_tokens;
                }
            }
            Ok(response) if response.status().as_u16() == 429 => stats.rate_limited += 1,
            Ok(_) | Err(_) => stats.failed += 1,
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Arc::new(Config::from_env());
    println!(
        "driving {} requests at concurrency {} against {:?}",
        config.requests, config.concurrency, config.urls
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("http client");

    let stats = Arc::new(Mutex::new(Stats::default()));
    let quota = Arc::new(Mutex::new(config.requests));

    let started = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..config.concurrency {
        tasks.push(tokio::spawn(worker(
            http.clone(),
            config.clone(),
            stats.clone(),
            quota.clone(),
        )));
    }
    for task in tasks {
        let _ = task.await;
    }

    stats.lock().await.print_summary(started.elapsed());
}

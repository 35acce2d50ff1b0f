use hashbrown::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use config::Config as CConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LinesCodec};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "counter";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::new(CONFIG_FILE).context("Error loading config")?;
    tracing_subscriber::fmt::init();

    // Three phases, each entered exactly once: connect, stream, report.
    let mut source = SequenceSource::connect(&config).await?;
    let report = Aggregator::new(config.limit).run(&mut source).await?;

    println!("{}", report);
    if config.print_histogram {
        for (value, count) in report.histogram.iter() {
            println!("{:>12} : {}", value, count);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
struct Config {
    log_level: String,
    host: String,
    port: u16,
    seed: i64,
    limit: u64,
    print_histogram: bool,
}

impl Config {
    fn new(path: &str) -> anyhow::Result<Self> {
        let mut c = CConfig::new();
        // The config file is optional; defaults cover every field and the
        // environment can override any of them (e.g. COUNTER_SEED=51).
        c.merge(config::File::with_name(path).required(false))?;
        c.merge(config::Environment::with_prefix(ENV_PREFIX))?;
        let config: Self = c.try_into()?;
        if config.limit == 0 {
            return Err(anyhow!("limit must be positive"));
        }
        std::env::set_var("RUST_LOG", &config.log_level);
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            host: "localhost".to_string(),
            port: 8888,
            seed: 34,
            limit: 10_000_000,
            print_histogram: false,
        }
    }
}

// A lazy, unbounded, non-restartable stream of integers read off a line-based
// transport. Generic over the transport so the tests can drive it with an
// in-memory duplex instead of a TcpStream.
struct SequenceSource<T> {
    lines: Framed<T, LinesCodec>,
}

impl SequenceSource<TcpStream> {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        tracing::debug!("Connecting to {}", addr);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Error connecting to {}", addr))?;
        tracing::info!("Connected to {}, seeding with {}", addr, config.seed);
        Self::handshake(stream, config.seed).await
    }
}

impl<T> SequenceSource<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    // Sends the seed line and flushes it before any read happens, so the
    // remote generator can observe it immediately. The transport is only
    // framed for reading after the handshake completes.
    async fn handshake(mut transport: T, seed: i64) -> anyhow::Result<Self> {
        transport
            .write_all(format!("{}\n", seed).as_bytes())
            .await
            .context("Error sending seed")?;
        transport.flush().await.context("Error flushing seed")?;
        Ok(Self {
            lines: Framed::new(transport, LinesCodec::new()),
        })
    }

    // Yields the next token, `None` once the peer closes the connection.
    // A line that is not a valid integer is an error, not a skip: the run
    // it belongs to must abort.
    async fn next(&mut self) -> anyhow::Result<Option<i64>> {
        match self.lines.next().await {
            None => Ok(None),
            Some(Err(err)) => Err(err).context("Error reading from stream"),
            Some(Ok(line)) => {
                let value = line
                    .trim()
                    .parse::<i64>()
                    .with_context(|| format!("Invalid integer line {:?}", line))?;
                Ok(Some(value))
            }
        }
    }
}

// Consumes a bounded prefix of a SequenceSource, tallying how often each
// value occurs and timing the whole consumption.
struct Aggregator {
    limit: u64,
    histogram: HashMap<i64, u64>,
}

impl Aggregator {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            histogram: HashMap::new(),
        }
    }

    fn observe(&mut self, value: i64) {
        *self.histogram.entry(value).or_insert(0) += 1;
    }

    // Pulls exactly `limit` tokens, never more. The source ending early is a
    // hard error: a throughput figure over a truncated sample is undefined,
    // so no partial report is produced.
    async fn run<T>(mut self, source: &mut SequenceSource<T>) -> anyhow::Result<RunReport>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let mut count = 0u64;
        while count < self.limit {
            match source.next().await? {
                Some(value) => {
                    self.observe(value);
                    count += 1;
                }
                None => {
                    return Err(anyhow!(
                        "Premature end of stream: got {} of {} elements",
                        count,
                        self.limit
                    ));
                }
            }
        }
        let elapsed = start.elapsed();
        tracing::info!("Consumed {} elements in {:?}", count, elapsed);
        Ok(RunReport {
            histogram: self.histogram,
            count,
            elapsed,
        })
    }
}

#[derive(Debug)]
struct RunReport {
    histogram: HashMap<i64, u64>,
    count: u64,
    elapsed: Duration,
}

impl RunReport {
    fn throughput(&self) -> f64 {
        self.count as f64 / self.elapsed.as_secs_f64()
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processed {} elements in {:.3}s, throughput {:.2} elements/sec",
            self.count,
            self.elapsed.as_secs_f64(),
            self.throughput()
        )
    }
}

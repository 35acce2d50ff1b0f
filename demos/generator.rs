// A local stand-in for the remote number-generation service: accepts a
// connection, reads one seed line, and streams pseudorandom decimal lines
// until the client hangs up. Run it with `cargo run --example generator`,
// then run stream-counter against it (localhost:8888 unless COUNTER_PORT
// says otherwise).
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Honors the same port override the client reads, so an overridden
    // client still has a local peer to talk to.
    let port = match std::env::var("COUNTER_PORT") {
        Ok(port) => port.parse::<u16>()?,
        Err(_) => 8888,
    };
    let listener = TcpListener::bind(("localhost", port)).await?;
    eprintln!("Generator listening on localhost:{}", port);
    loop {
        let (socket, client_info) = listener.accept().await?;
        eprintln!("Serving {:?}", client_info);
        tokio::spawn(async move {
            let (read_half, write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);

            let mut line = String::new();
            if reader.read_line(&mut line).await.is_err() {
                return;
            }
            let seed = line.trim().parse::<i64>().unwrap_or(1234);
            eprintln!("Seed is {} (line was {:?})", seed, line);

            let mut rng = StdRng::seed_from_u64(seed as u64);
            let mut writer = BufWriter::new(write_half);
            loop {
                let value: u32 = rng.gen_range(0..1000);
                let message = format!("{}\n", value);
                if writer.write_all(message.as_bytes()).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            eprintln!("Done serving {:?}", client_info);
        });
    }
}

use amqp_test_broker::config::Config;
use amqp_test_broker::console;
use amqp_test_broker::server::Server;
use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    console::init_tracing();

    let config = Config::from_env()?;
    let server = Server::bind(config).await?;

    tokio::select! {
        result = server.run() => result,
        // Interrupt ends the broker without an error report.
        _ = tokio::signal::ctrl_c() => Ok(()),
    }
}

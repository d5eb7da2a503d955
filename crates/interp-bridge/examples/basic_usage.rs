//! Basic usage example - launch a Python endpoint and call into it

use interp_bridge::{
    bridge_proxy, MainModule, Result, ServiceCache, ServiceKey, StatementBatch,
};

bridge_proxy! {
    pub struct Arith {
        fn plus(a: i64, b: i64) -> i64;
        fn mean(values: Vec<f64>) -> f64;
    }
}

const ARITH_SOURCE: &str = "\
def plus(a, b):
    return a + b

def mean(values):
    values = list(values)
    return sum(values) / len(values)
";

#[tokio::main]
async fn main() -> Result<()> {
    // Interpreter from args or python3 on PATH
    let python = std::env::args().nth(1).unwrap_or_else(|| "python3".to_string());

    let cache = ServiceCache::default();
    let command = MainModule::command(&python, &std::env::temp_dir().join("interp-bridge"))?;
    let service = cache
        .get_or_create(&ServiceKey::new("basic-usage", &python), &command)
        .await?;
    println!("Interpreter {} listening on port {}", python, service.port());

    service
        .client()
        .register_source(ARITH_SOURCE, &["plus", "mean"], false)
        .await?;

    let arith: Arith = service.proxies().new_proxy_instance(false);
    println!("plus(2, 3) = {}", arith.plus(2, 3).await?);

    let samples: Vec<f64> = (0..10_000).map(|i| (i % 100) as f64).collect();
    println!("mean of {} samples = {}", samples.len(), arith.mean(samples).await?);

    let channel = service.commands();
    let pending = channel
        .sync_exec(
            StatementBatch::new()
                .statement("import sys")
                .statement("version = sys.version.split()[0]")
                .output("version"),
        )
        .await;
    if let Some(Ok(outputs)) = pending.outcome() {
        println!("Remote interpreter version: {}", outputs["version"].to_wire());
    }

    cache.clear().await;
    Ok(())
}

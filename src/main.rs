use stress_test::{stress_test_scaling, stress_test_sync};
use tracing_subscriber::EnvFilter;
use weft_sync::SyncError;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(async_main()) {
        eprintln!("stress test failed: {}", e);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<(), SyncError> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC SYNC STRESS TESTS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: small scale
    let stats = stress_test_sync(3, 100, 50).await?;
    stats.print();

    // Test 2: medium scale
    let stats = stress_test_sync(8, 300, 400).await?;
    stats.print();

    // Test 3: scaling analysis
    stress_test_scaling(12, 4).await?;

    println!("\n✓ All stress tests completed!");
    Ok(())
}

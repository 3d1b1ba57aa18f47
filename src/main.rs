#[tokio::main]
async fn main() {
    if let Err(error) = mobileqq::run().await {
        eprintln!("fatal: {error:#}");
        std::process::exit(1);
    }
}

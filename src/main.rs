use tsbundle::cli::CliHandler;

#[tokio::main]
async fn main() {
    let code = CliHandler::run().await;
    std::process::exit(code);
}

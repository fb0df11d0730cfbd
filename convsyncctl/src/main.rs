use clap::Parser;

#[tokio::main]
async fn main() {
    convsyncctl::init_tracing();
    let cli = convsyncctl::Cli::parse();
    match convsyncctl::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("erro: {err}");
            std::process::exit(1);
        }
    }
}

use clap::Parser;

fn main() {
    let cli = courierctl::Cli::parse();
    if let Err(err) = courierctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

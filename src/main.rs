fn main() {
    lookout::env_loader::load_dotenv();

    if let Err(err) = lookout::cli::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

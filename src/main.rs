fn main() {
    if let Err(e) = bbs_backup::cli::run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

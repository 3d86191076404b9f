fn main() -> Result<(), Box<dyn std::error::Error>> {
    oneclick_lib::cli::run()
}

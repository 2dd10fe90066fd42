use log::error;
use migrastep::cli::Cli;

fn main() {
    if let Err(err) = Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

use phantom::{parse_args, Phantom, ProcessHost};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let outcome = parse_args(std::env::args_os().skip(1));
    let mut phantom = Phantom::new(outcome, Box::new(ProcessHost::new())).map_err(|err| {
        log::error!("{}", err);
        err
    })?;

    if !phantom.execute() {
        log::debug!("Script did not complete");
    }

    let code = phantom.return_value();
    drop(phantom);
    std::process::exit(code);
}

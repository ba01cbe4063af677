use std::process::ExitCode;

use tracing::error;

use parget::cli;
use parget::common::{logger, vt};
use parget::session;

fn main() -> ExitCode {
    let args = cli::parse_args();

    let params = match args.into_params() {
        Ok(params) => params,
        Err(e) => {
            eprintln!("parget: {e}");
            return ExitCode::from(1);
        }
    };

    logger::init(params.verbosity);
    vt::set_no_color(params.no_color);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start the async runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match session::run(params, runtime.handle().clone()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

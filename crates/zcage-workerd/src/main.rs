use std::path::PathBuf;

use zcage_wire::status;

fn main() {
    let mut args = std::env::args_os().skip(1);
    let sock_path = match (args.next(), args.next()) {
        (Some(path), None) => PathBuf::from(path),
        _ => {
            eprintln!("usage: zcage-workerd <socket-path>");
            std::process::exit(status::BAD_ARGUMENTS);
        }
    };
    std::process::exit(zcage_worker::run(&sock_path));
}

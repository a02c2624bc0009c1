use structopt::StructOpt;

fn main() {
    let config = mk::Config::from_args();
    match mk::run(config) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mk: {:#}", err);
            std::process::exit(1);
        }
    }
}

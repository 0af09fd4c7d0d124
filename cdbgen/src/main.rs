extern crate cdbgen;
extern crate cdbx_rs;
extern crate clap;
extern crate env_logger;

use clap::{App, AppSettings, Arg, SubCommand};
use std::io::{self, BufWriter};
use std::path::Path;
use std::process;

fn run() -> cdbx_rs::Result<()> {
    let matches = App::new("cdbgen")
        .about("generate, build and dump constant databases")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("gen")
                .about("write random records in cdbmake format to stdout")
                .arg(
                    Arg::with_name("count")
                        .required(true)
                        .help("number of records to generate"),
                ),
        )
        .subcommand(
            SubCommand::with_name("make")
                .about("build a cdb file from cdbmake records on stdin")
                .arg(Arg::with_name("file").required(true).help("output cdb path")),
        )
        .subcommand(
            SubCommand::with_name("dump")
                .about("write a cdb file to stdout as cdbmake records")
                .arg(Arg::with_name("file").required(true).help("cdb file to dump")),
        )
        .get_matches();

    match matches.subcommand() {
        ("gen", Some(sub)) => {
            let count: usize = sub.value_of("count").unwrap().parse()?;
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            cdbgen::gen(&mut out, count)
        }
        ("make", Some(sub)) => {
            let path = Path::new(sub.value_of("file").unwrap());
            let stdin = io::stdin();
            let count = cdbgen::make(stdin.lock(), path)?;
            eprintln!("wrote {} records to {}", count, path.display());
            Ok(())
        }
        ("dump", Some(sub)) => {
            let path = Path::new(sub.value_of("file").unwrap());
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            cdbgen::dump(path, &mut out).map(|_| ())
        }
        _ => unreachable!(),
    }
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("cdbgen: {}", err);
        process::exit(1);
    }
}

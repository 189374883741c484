use clap::{Arg, ArgAction, Command};
use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use replink::config::{FileBackend, SessionConfig};
use replink::events::DeviceEvent;
use replink::logging;
use replink::session::Session;

fn cli() -> Command {
	Command::new("replink")
		.version("0.2.0")
		.about("Talk to MicroPython boards over WebSocket")
		.subcommand_required(true)
		.arg(
			Arg::new("url")
				.short('u')
				.long("url")
				.value_name("URL")
				.help("Device address (ws://host:port)"),
		)
		.arg(
			Arg::new("password")
				.short('p')
				.long("password")
				.value_name("PASSWORD")
				.help("Credential for the device password prompt"),
		)
		.arg(
			Arg::new("config")
				.short('c')
				.long("config")
				.value_name("FILE")
				.help("TOML config file"),
		)
		.arg(
			Arg::new("legacy")
				.long("legacy")
				.action(ArgAction::SetTrue)
				.help("Use the legacy single-shot file protocol"),
		)
		.subcommand(
			Command::new("exec")
				.about("Execute code on the device")
				.arg(Arg::new("code").required(true)),
		)
		.subcommand(
			Command::new("get")
				.about("Read a device file")
				.arg(Arg::new("path").required(true))
				.arg(Arg::new("out").help("Local output path (stdout if omitted)")),
		)
		.subcommand(
			Command::new("put")
				.about("Write a local file to the device")
				.arg(Arg::new("file").required(true))
				.arg(Arg::new("path").required(true)),
		)
		.subcommand(
			Command::new("ls")
				.about("List a device directory")
				.arg(Arg::new("path").default_value("/")),
		)
		.subcommand(Command::new("rm").about("Delete a device entry").arg(Arg::new("path").required(true)))
		.subcommand(
			Command::new("mv")
				.about("Rename a device entry")
				.arg(Arg::new("old").required(true))
				.arg(Arg::new("new").required(true)),
		)
		.subcommand(
			Command::new("mkdir").about("Create a device directory").arg(Arg::new("path").required(true)),
		)
		.subcommand(Command::new("monitor").about("Print device events until interrupted"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	logging::init_tracing();
	let matches = cli().get_matches();

	let mut config = match matches.get_one::<String>("config") {
		Some(path) => SessionConfig::load(&PathBuf::from(path))?,
		None => SessionConfig::default(),
	};
	if let Some(url) = matches.get_one::<String>("url") {
		config.url = url.clone();
	}
	if let Some(password) = matches.get_one::<String>("password") {
		config.password = Some(password.clone());
	}
	if matches.get_flag("legacy") {
		config.backend = FileBackend::Legacy;
	}
	if config.url.is_empty() {
		return Err("No device address: pass --url or a config file".into());
	}

	let session = Session::new(config);
	let mut events = session.take_events().ok_or("Event channel unavailable")?;

	let monitor = matches.subcommand_name() == Some("monitor");
	let printer = tokio::spawn(async move {
		while let Some(event) = events.recv().await {
			match event {
				DeviceEvent::Data { text, is_error } => {
					if is_error {
						eprint!("{}", text);
						let _ = std::io::stderr().flush();
					} else {
						print!("{}", text);
						let _ = std::io::stdout().flush();
					}
				}
				other if monitor => eprintln!("{:?}", other),
				_ => {}
			}
		}
	});

	session.connect().await?;
	let result = run(&session, &matches).await;
	session.disconnect().await?;
	printer.abort();
	result
}

async fn run(session: &Session, matches: &clap::ArgMatches) -> Result<(), Box<dyn Error>> {
	match matches.subcommand() {
		Some(("exec", sub)) => {
			let code = sub.get_one::<String>("code").unwrap();
			session.execute(code, false).await?;
		}
		Some(("get", sub)) => {
			let path = sub.get_one::<String>("path").unwrap();
			let bytes = session.read_file(path).await?;
			match sub.get_one::<String>("out") {
				Some(out) => std::fs::write(out, &bytes)?,
				None => std::io::stdout().write_all(&bytes)?,
			}
		}
		Some(("put", sub)) => {
			let file = sub.get_one::<String>("file").unwrap();
			let path = sub.get_one::<String>("path").unwrap();
			let bytes = std::fs::read(file)?;
			session.write_file(path, &bytes).await?;
		}
		Some(("ls", sub)) => {
			let path = sub.get_one::<String>("path").unwrap();
			for entry in session.list_dir(path).await? {
				match entry.kind {
					replink::protocol::EntryKind::Dir => println!("{}/", entry.name),
					replink::protocol::EntryKind::File => {
						println!("{}\t{}", entry.name, entry.size)
					}
				}
			}
		}
		Some(("rm", sub)) => {
			session.delete(sub.get_one::<String>("path").unwrap()).await?;
		}
		Some(("mv", sub)) => {
			let old = sub.get_one::<String>("old").unwrap();
			let new = sub.get_one::<String>("new").unwrap();
			session.rename(old, new).await?;
		}
		Some(("mkdir", sub)) => {
			session.make_dir(sub.get_one::<String>("path").unwrap()).await?;
		}
		Some(("monitor", _)) => {
			// Events are printed by the spawned task; wait for ctrl-c
			tokio::signal::ctrl_c().await?;
		}
		_ => unreachable!("subcommand required"),
	}
	Ok(())
}

// vim: ts=4

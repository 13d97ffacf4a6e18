use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "spresso")]
#[command(about = "WebDriver server driving Android apps through Espresso")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Address to listen on
	#[arg(long, value_name = "HOST")]
	pub host: Option<String>,

	/// Port to listen on
	#[arg(short, long, value_name = "PORT")]
	pub port: Option<u16>,

	/// Config file (defaults to $XDG_CONFIG_HOME/spresso/config.json)
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Prebuilt Espresso server APK
	#[arg(long, value_name = "APK")]
	pub server_apk: Option<PathBuf>,

	/// adb executable (defaults to the Android SDK or PATH)
	#[arg(long, value_name = "PATH")]
	pub adb: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flags_are_optional() {
		let cli = Cli::try_parse_from(["spresso"]).unwrap();
		assert_eq!(cli.verbose, 0);
		assert!(cli.port.is_none());
		assert!(cli.server_apk.is_none());
	}

	#[test]
	fn verbosity_counts() {
		let cli = Cli::try_parse_from(["spresso", "-vv", "--port", "4724", "--server-apk", "/srv/server.apk"]).unwrap();
		assert_eq!(cli.verbose, 2);
		assert_eq!(cli.port, Some(4724));
		assert_eq!(cli.server_apk, Some(PathBuf::from("/srv/server.apk")));
	}
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};

use govee_lan_lib::automation::rule::{AutomationRule, RuleAction, RuleBook, RuleSet};
use govee_lan_lib::automation::{Scheduler, StartStatus, POLL_INTERVAL};
use govee_lan_lib::control_interface::{
    CliColors, ControlInterface, DeviceTarget, Reply, RetryPolicy, SendOptions, RGB,
};
use govee_lan_lib::util::discovery::Discovery;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "govee_lan",
    about = "Controls lights over the local UDP LAN API",
    version
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Transport settings shared by every command that talks to a device.
#[derive(Args)]
pub struct TransportArgs {
    /// Per-attempt timeout in milliseconds
    #[clap(long = "timeout", default_value_t = 1000)]
    timeout: u64,

    /// Attempts made after the first one fails
    #[clap(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(0..=100))]
    retries: u32,

    /// Pause between attempts in milliseconds
    #[clap(long, default_value_t = 300)]
    retry_delay: u64,
}

impl TransportArgs {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    fn control_interface(&self, address: &str) -> ControlInterface {
        ControlInterface::new(address)
            .with_retry_policy(RetryPolicy {
                max_attempts: self.retries,
                retry_delay: Duration::from_millis(self.retry_delay),
            })
            .with_timeout(self.timeout())
    }
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Subcommand for operations that require device communication
    #[clap(name = "device-call")]
    DeviceCall {
        /// Sets the IP address of the device
        #[clap(long)]
        ip: String,

        /// Device identifier added to commands that need it
        #[clap(long)]
        device: Option<String>,

        /// Model number added to commands that need it
        #[clap(long)]
        sku: Option<String>,

        /// Print the packets sent during this call
        #[clap(long)]
        show_packets: bool,

        #[clap(flatten)]
        transport: TransportArgs,

        #[clap(subcommand)]
        action: DeviceAction,
    },
    /// Scans every local interface for devices
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Listening time per interface in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 2000)]
        timeout: u64,
    },
    /// Runs the daily rules from a rule file until interrupted
    #[clap(name = "automate")]
    Automate {
        /// Path to the rule file
        #[clap(long)]
        rules: PathBuf,

        /// Device address, overriding the one in the rule file
        #[clap(long)]
        ip: Option<String>,

        #[clap(flatten)]
        transport: TransportArgs,
    },
    /// Edits a rule file
    #[clap(name = "rules")]
    Rules {
        /// Path to the rule file
        #[clap(long)]
        rules: PathBuf,

        #[clap(subcommand)]
        action: RulesAction,
    },
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Turns the light on.
    #[clap(name = "on")]
    On,
    /// Turns the light off.
    #[clap(name = "off")]
    Off,
    /// Sets the brightness in percent.
    #[clap(name = "brightness")]
    Brightness {
        #[clap(value_parser = clap::value_parser!(i64).range(1..=100))]
        value: i64,
    },
    /// Sets an RGB color.
    #[clap(name = "color")]
    Color {
        /// The color to display by name
        #[clap(value_enum)]
        color: Option<CliColors>,

        /// Red component of the color (0-255)
        #[clap(short = 'r', long = "red", value_parser = clap::value_parser!(u8))]
        red: Option<u8>,

        /// Green component of the color (0-255)
        #[clap(short = 'g', long = "green", value_parser = clap::value_parser!(u8))]
        green: Option<u8>,

        /// Blue component of the color (0-255)
        #[clap(short = 'b', long = "blue", value_parser = clap::value_parser!(u8))]
        blue: Option<u8>,
    },
    /// Sets the white color temperature in Kelvin.
    #[clap(name = "color-temperature")]
    ColorTemperature {
        #[clap(value_parser = clap::value_parser!(i64).range(1000..=10000))]
        kelvin: i64,
    },
    /// Activates a built-in scene by its id.
    #[clap(name = "scene")]
    Scene { scene_id: u32 },
    /// Queries the device status.
    #[clap(name = "status")]
    Status,
    /// Turns the light off and on again.
    #[clap(name = "power-cycle")]
    PowerCycle,
    /// Sends an arbitrary command or payload.
    #[clap(name = "raw")]
    Raw {
        /// Command name, sent with `--data`
        #[clap(long, conflicts_with = "payload", required_unless_present = "payload")]
        cmd: Option<String>,

        /// JSON object sent as the command's data
        #[clap(long, requires = "cmd")]
        data: Option<String>,

        /// Complete JSON payload including `msg`
        #[clap(long)]
        payload: Option<String>,

        /// Wait for a reply
        #[clap(long)]
        expect_reply: bool,
    },
}

/// Rule actions accepted by `rules add`.
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum CliRuleAction {
    On,
    Off,
    Brightness,
    Rgb,
}

/// Actions available under the `rules` subcommand
#[derive(Subcommand)]
pub enum RulesAction {
    /// Lists the rules in order.
    #[clap(name = "list")]
    List,
    /// Appends a rule.
    #[clap(name = "add")]
    Add {
        /// Time of day as HH:MM
        #[clap(long)]
        time: String,

        #[clap(long, value_enum)]
        action: CliRuleAction,

        /// Brightness for the `brightness` action
        #[clap(long, value_parser = clap::value_parser!(i64).range(1..=100))]
        value: Option<i64>,

        #[clap(short = 'r', long = "red", value_parser = clap::value_parser!(u8))]
        red: Option<u8>,

        #[clap(short = 'g', long = "green", value_parser = clap::value_parser!(u8))]
        green: Option<u8>,

        #[clap(short = 'b', long = "blue", value_parser = clap::value_parser!(u8))]
        blue: Option<u8>,
    },
    /// Removes the rule at a position (0-based).
    #[clap(name = "remove")]
    Remove { index: usize },
    /// Sets the device address stored in the rule file.
    #[clap(name = "set-ip")]
    SetIp { ip: String },
}

fn parse_object(label: &str, text: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(text).with_context(|| format!("{} is not valid JSON", label))? {
        Value::Object(map) => Ok(map),
        _ => bail!("{} must be a JSON object", label),
    }
}

fn print_reply(reply: Option<Reply>) -> Result<()> {
    match reply {
        Some(reply) => println!("{}", serde_json::to_string_pretty(&reply)?),
        None => println!("(no reply)"),
    }
    Ok(())
}

fn print_serialized<T: Serialize + ?Sized>(value: &T, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Plaintext | OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?)
        }
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn load_or_default(path: &Path) -> Result<RuleSet> {
    if path.exists() {
        RuleSet::load(path)
    } else {
        Ok(RuleSet::default())
    }
}

async fn handle_device_call(control: &ControlInterface, action: DeviceAction, timeout: Duration) -> Result<()> {
    match action {
        DeviceAction::On => {
            control.turn_on().await;
            println!("Sent: on");
        }
        DeviceAction::Off => {
            control.turn_off().await;
            println!("Sent: off");
        }
        DeviceAction::Brightness { value } => {
            control.set_brightness(value).await;
            println!("Sent: brightness {}%", value);
        }
        DeviceAction::Color {
            color,
            red,
            green,
            blue,
        } => {
            let color_to_show: RGB = match (color, red, green, blue) {
                (Some(color_name), None, None, None) => color_name.into(),
                (None, Some(r), Some(g), Some(b)) => RGB {
                    red: r,
                    green: g,
                    blue: b,
                },
                _ => return Err(anyhow!("Invalid color specification")),
            };
            control.set_color(color_to_show).await;
            println!("Sent: color {:?}", color_to_show);
        }
        DeviceAction::ColorTemperature { kelvin } => {
            control.set_color_temperature(kelvin).await;
            println!("Sent: color temperature {}K", kelvin);
        }
        DeviceAction::Scene { scene_id } => {
            control.activate_scene(scene_id).await;
            println!("Sent: scene {}", scene_id);
        }
        DeviceAction::Status => print_reply(control.get_status().await)?,
        DeviceAction::PowerCycle => {
            control.power_cycle().await;
            println!("Sent: power cycle");
        }
        DeviceAction::Raw {
            cmd,
            data,
            payload,
            expect_reply,
        } => {
            let options = SendOptions {
                expect_reply,
                timeout,
                ..SendOptions::default()
            };
            let reply = match (cmd, payload) {
                (_, Some(payload)) => {
                    control
                        .send_payload(parse_object("payload", &payload)?, options)
                        .await
                }
                (Some(cmd), None) => {
                    let data = match data {
                        Some(data) => parse_object("data", &data)?,
                        None => Map::new(),
                    };
                    control.send_command(&cmd, data, options).await
                }
                (None, None) => bail!("Either --cmd or --payload is required"),
            };
            print_reply(reply)?;
        }
    }
    Ok(())
}

async fn run_automation(rules_path: PathBuf, ip: Option<String>, transport: TransportArgs) -> Result<()> {
    let rule_set = RuleSet::load(&rules_path)?;
    let address = ip.clone().unwrap_or_else(|| rule_set.device_ip.clone());
    if address.trim().is_empty() {
        bail!("No device address: pass --ip or set device_ip in {}", rules_path.display());
    }

    let control = transport.control_interface(&address);
    let book = RuleBook::new(rule_set.rules);
    let scheduler = Scheduler::new(control.clone());

    println!(
        "Running {} rule(s) from {} for {}",
        book.len(),
        rules_path.display(),
        address
    );
    if scheduler.start(DeviceTarget::new(&address), book.clone()) == StartStatus::AlreadyRunning {
        bail!("Automation is already running");
    }

    let mut reload = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = reload.tick() => match RuleSet::load(&rules_path) {
                Ok(updated) => {
                    if ip.is_none() && !updated.device_ip.trim().is_empty()
                        && updated.device_ip.trim() != control.target().snapshot().address
                    {
                        println!("Device address changed to {}", updated.device_ip.trim());
                        control.target().set_address(&updated.device_ip);
                    }
                    book.replace(updated.rules);
                }
                Err(e) => debug!("Keeping previous rules: {:#}", e),
            },
        }
    }

    scheduler.shutdown().await;
    println!("Automation stopped.");
    Ok(())
}

fn handle_rules(path: PathBuf, action: RulesAction) -> Result<()> {
    let mut rule_set = load_or_default(&path)?;
    match action {
        RulesAction::List => {
            println!("Device: {}", rule_set.device_ip);
            for (index, rule) in rule_set.rules.iter().enumerate() {
                match rule.to_action() {
                    Ok(action) => println!("{:>3}  {}  {}", index, rule.time, action),
                    Err(e) => println!("{:>3}  {}  invalid: {:#}", index, rule.time, e),
                }
            }
            return Ok(());
        }
        RulesAction::Add {
            time,
            action,
            value,
            red,
            green,
            blue,
        } => {
            let action = match action {
                CliRuleAction::On => RuleAction::PowerOn,
                CliRuleAction::Off => RuleAction::PowerOff,
                CliRuleAction::Brightness => RuleAction::Brightness(
                    value.ok_or_else(|| anyhow!("--value is required for brightness"))?,
                ),
                CliRuleAction::Rgb => match (red, green, blue) {
                    (Some(r), Some(g), Some(b)) => RuleAction::Rgb(r.into(), g.into(), b.into()),
                    _ => bail!("--red, --green and --blue are required for rgb"),
                },
            };
            let rule = AutomationRule::new(&time, action)?;
            println!("Added rule #{}: {} {}", rule_set.rules.len(), rule.time, action);
            rule_set.rules.push(rule);
        }
        RulesAction::Remove { index } => {
            if index >= rule_set.rules.len() {
                bail!("Invalid index {}, the file has {} rule(s)", index, rule_set.rules.len());
            }
            let removed = rule_set.rules.remove(index);
            println!("Removed rule #{}: {} {}", index, removed.time, removed.action);
        }
        RulesAction::SetIp { ip } => {
            rule_set.device_ip = ip.trim().to_string();
            println!("Device address set to {}", rule_set.device_ip);
        }
    }
    rule_set.save(&path)
}

async fn handle_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Discover { output, timeout } => {
            let devices = Discovery::find_devices(Duration::from_millis(timeout)).await;
            match output {
                OutputFormat::Plaintext => {
                    Discovery::pretty_print_devices(&devices);
                }
                _ => print_serialized(&devices, output)?,
            }
        }
        Commands::DeviceCall {
            ip,
            device,
            sku,
            show_packets,
            transport,
            action,
        } => {
            let control = transport.control_interface(&ip);
            control
                .target()
                .set_device_info(device.as_deref(), sku.as_deref());

            handle_device_call(&control, action, transport.timeout()).await?;

            if show_packets {
                print_serialized(&control.packet_monitor().list(), OutputFormat::Json)?;
            }
        }
        Commands::Automate {
            rules,
            ip,
            transport,
        } => run_automation(rules, ip, transport).await?,
        Commands::Rules { rules, action } => handle_rules(rules, action)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_arguments_are_rejected() {
        for args in [
            vec!["govee_lan", "device-call", "--ip", "10.0.0.5", "brightness", "0"],
            vec!["govee_lan", "device-call", "--ip", "10.0.0.5", "brightness", "101"],
            vec!["govee_lan", "device-call", "--ip", "10.0.0.5", "scene", "-1"],
            vec!["govee_lan", "device-call", "--ip", "10.0.0.5", "color", "-r", "256", "-g", "0", "-b", "0"],
            vec!["govee_lan", "device-call", "--ip", "10.0.0.5", "color-temperature", "500"],
            vec!["govee_lan", "rules", "--rules", "r.json", "add", "--time", "18:00", "--action", "strobe"],
            vec!["govee_lan", "device-call", "--ip", "10.0.0.5", "--retries", "4294967295", "on"],
        ] {
            assert!(Cli::try_parse_from(&args).is_err(), "{:?}", args);
        }
    }

    #[test]
    fn test_transport_flags() {
        let cli = Cli::try_parse_from([
            "govee_lan", "device-call", "--ip", "10.0.0.5", "--timeout", "250", "--retries", "0",
            "--retry-delay", "10", "status",
        ])
        .unwrap();
        let Commands::DeviceCall { transport, .. } = cli.command else {
            panic!("expected device-call");
        };
        let control = transport.control_interface("10.0.0.5");
        assert_eq!(control.retry_policy().total_attempts(), 1);
        assert_eq!(control.retry_policy().retry_delay, Duration::from_millis(10));
        assert_eq!(transport.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_rules_add_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        handle_rules(path.clone(), RulesAction::SetIp { ip: " 10.0.0.5 ".to_string() }).unwrap();
        handle_rules(
            path.clone(),
            RulesAction::Add {
                time: "18:00".to_string(),
                action: CliRuleAction::Rgb,
                value: None,
                red: Some(255),
                green: Some(80),
                blue: Some(0),
            },
        )
        .unwrap();
        handle_rules(
            path.clone(),
            RulesAction::Add {
                time: "23:30".to_string(),
                action: CliRuleAction::Off,
                value: None,
                red: None,
                green: None,
                blue: None,
            },
        )
        .unwrap();

        let saved = RuleSet::load(&path).unwrap();
        assert_eq!(saved.device_ip, "10.0.0.5");
        assert_eq!(saved.rules[0].to_action().unwrap(), RuleAction::Rgb(255, 80, 0));

        handle_rules(path.clone(), RulesAction::Remove { index: 0 }).unwrap();
        let saved = RuleSet::load(&path).unwrap();
        assert_eq!(saved.rules.len(), 1);
        assert_eq!(saved.rules[0].time, "23:30");
        assert!(handle_rules(path, RulesAction::Remove { index: 4 }).is_err());
    }

    #[test]
    fn test_rules_add_validates_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let bad_time = RulesAction::Add {
            time: "6pm".to_string(),
            action: CliRuleAction::On,
            value: None,
            red: None,
            green: None,
            blue: None,
        };
        assert!(handle_rules(path.clone(), bad_time).is_err());

        let missing_value = RulesAction::Add {
            time: "06:00".to_string(),
            action: CliRuleAction::Brightness,
            value: None,
            red: None,
            green: None,
            blue: None,
        };
        assert!(handle_rules(path.clone(), missing_value).is_err());
        assert!(!path.exists());
    }
}

mod args;

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dkit::config::{Config, MonitorConfig};
use dkit::error::UpsdError;
use dkit::types::protocol::StatusFlag;
use dkit::upsd::UpsdSession;
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval, MissedTickBehavior};
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Level};

use crate::args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(error) => {
            error!(error = %format!("{error:#}"), "unusable configuration");
            return ExitCode::from(2);
        },
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    if let Err(error) = begin(config, args.once, cancel).await {
        error!(error = %format!("{error:#}"), "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Reads the config file, if any, then applies command line overrides.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(address) = &args.address {
        config.upsd.address = address.clone();
    }
    if let Some(username) = &args.username {
        config.upsd.username = username.clone();
    }
    if let Some(path) = &args.password_file {
        config.upsd.password = None;
        config.upsd.password_file = Some(path.clone());
    }

    Ok(config)
}

async fn begin(
    config: Config,
    once: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let password = config
        .upsd
        .resolve_password()
        .context("reading upsd password")?;

    let mut session =
        UpsdSession::connect(&config.upsd.address, config.upsd.io_timeout())
            .await
            .context("connecting to upsd")?;

    let ret = async {
        session
            .login(&config.upsd.username, &password)
            .await
            .context("logging in to upsd")?;

        if once {
            report(&mut session).await
        } else {
            monitor(&mut session, &config.monitor, cancel).await
        }
    }
    .await;

    session.close().await;

    ret
}

/// Prints the mains state and the commonly watched status flags.
async fn report<S: AsyncRead + AsyncWrite>(
    session: &mut UpsdSession<S>,
) -> Result<()> {
    let unit = session.default_unit().unwrap_or("-").to_owned();
    let (mains, flags) = poll(session).await.context("querying upsd")?;

    println!("ups:        {unit}");
    println!("mains good: {mains}");
    for flag in [
        StatusFlag::Online,
        StatusFlag::LowBattery,
        StatusFlag::Charging,
        StatusFlag::OnBattery,
    ] {
        println!("{:<11} {}", format!("{flag}:"), flags.contains(&flag));
    }
    println!("status:     {}", flags.iter().join(" "));

    Ok(())
}

/// Reads mains state and status flags, failing rather than guessing.
async fn poll<S: AsyncRead + AsyncWrite>(
    session: &mut UpsdSession<S>,
) -> Result<(bool, Vec<StatusFlag>), UpsdError> {
    let mains = session.try_is_power_mains_good().await?;
    let flags = session.try_status_flags().await?;

    Ok((mains, flags))
}

/// Polls until cancelled. A lost or desynchronised connection ends the loop
/// with an error; a rejected or garbled reply only skips that poll.
#[instrument(skip_all, fields(ups = session.default_unit()))]
async fn monitor<S: AsyncRead + AsyncWrite>(
    session: &mut UpsdSession<S>,
    config: &MonitorConfig,
    cancel: CancellationToken,
) -> Result<()> {
    if session.default_unit().is_none() {
        bail!("upsd lists no UPS units");
    }

    let mut ticks = interval(config.poll_interval());
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut mains_good = None;
    let mut load_off_scheduled = false;

    loop {
        select! {
            _ = ticks.tick() => {},
            _ = cancel.cancelled() => return Ok(()),
        };

        let (mains, flags) = match poll(session).await {
            Ok(state) => state,
            Err(error) if error.is_connection_lost() => {
                return Err(error).context("polling upsd");
            },
            Err(error) => {
                warn!(%error, "poll failed, keeping last known state");
                continue;
            },
        };
        let status = flags.iter().join(" ");

        match (mains_good, mains) {
            (None, _) => info!(mains, %status, "initial state"),
            (Some(false), true) => info!(%status, "mains power restored"),
            (Some(true), false) => warn!(%status, "mains power lost"),
            _ => {},
        }
        mains_good = Some(mains);

        if flags.contains(&StatusFlag::Online) {
            load_off_scheduled = false;
        }

        if config.shutdown_on_low_battery
            && !load_off_scheduled
            && flags.contains(&StatusFlag::OnBattery)
            && flags.contains(&StatusFlag::LowBattery)
        {
            session
                .schedule_load_off_in(config.load_off_delay_secs)
                .await
                .context("scheduling load off")?;
            load_off_scheduled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use dkit::line_reader::LineReader;
    use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    type Step = (&'static str, &'static str);

    const LOGIN: &[Step] = &[
        ("USERNAME admin", "OK\n"),
        ("PASSWORD pw", "OK\n"),
        ("LIST UPS", "BEGIN LIST UPS\nUPS myups \"Test\"\nEND LIST UPS\n"),
    ];

    /// Answers each expected request in turn, then hangs up.
    fn daemon(steps: &'static [Step]) -> (DuplexStream, JoinHandle<()>) {
        let (client, server) = duplex(4096);

        let task = tokio::spawn(async move {
            let (r, mut w) = split(server);
            let mut r: LineReader<_> = r.into();

            for (request, reply) in LOGIN.iter().chain(steps) {
                assert_eq!(r.read_line().await.unwrap().unwrap(), *request);
                w.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        (client, task)
    }

    fn config(shutdown_on_low_battery: bool) -> MonitorConfig {
        MonitorConfig {
            poll_interval_secs: 1,
            shutdown_on_low_battery,
            ..Default::default()
        }
    }

    async fn run(
        steps: &'static [Step],
        config: MonitorConfig,
    ) -> Result<()> {
        let (stream, task) = daemon(steps);
        let mut session = UpsdSession::new(stream, None);
        session.login("admin", "pw").await.unwrap();

        let ret = timeout(
            Duration::from_secs(10),
            monitor(&mut session, &config, CancellationToken::new()),
        )
        .await
        .expect("monitor kept polling a closed connection");
        task.await.unwrap();

        ret
    }

    #[tokio::test]
    async fn test_hang_up_ends_monitoring_with_an_error() {
        let err = run(
            &[
                (
                    "GET VAR myups input.voltage",
                    "VAR myups input.voltage \"230.0\"\n",
                ),
                ("GET VAR myups ups.status", "VAR myups ups.status \"OL\"\n"),
            ],
            config(false),
        )
        .await
        .unwrap_err();

        let lost = err.downcast_ref::<UpsdError>().unwrap();
        assert!(lost.is_connection_lost());
    }

    #[tokio::test]
    async fn test_low_battery_schedules_load_off() {
        let err = run(
            &[
                (
                    "GET VAR myups input.voltage",
                    "VAR myups input.voltage \"0.0\"\n",
                ),
                (
                    "GET VAR myups ups.status",
                    "VAR myups ups.status \"OB LB\"\n",
                ),
                ("INSTCMD myups load.off.delay 15", "OK\n"),
            ],
            config(true),
        )
        .await
        .unwrap_err();

        assert!(err.downcast_ref::<UpsdError>().unwrap().is_connection_lost());
    }

    #[tokio::test]
    async fn test_rejected_reply_skips_one_poll() {
        let err = run(
            &[
                ("GET VAR myups input.voltage", "ERR DATA-STALE\n"),
                (
                    "GET VAR myups input.voltage",
                    "VAR myups input.voltage \"230.0\"\n",
                ),
                ("GET VAR myups ups.status", "VAR myups ups.status \"OL\"\n"),
            ],
            config(false),
        )
        .await
        .unwrap_err();

        assert!(err.downcast_ref::<UpsdError>().unwrap().is_connection_lost());
    }

    #[tokio::test]
    async fn test_no_units_is_an_error() {
        let (client, server) = duplex(4096);
        let mut session = UpsdSession::new(client, None);
        drop(server);

        let cancel = CancellationToken::new();
        let err = monitor(&mut session, &config(false), cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no UPS units"));
    }
}

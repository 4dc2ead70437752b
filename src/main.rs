//! ringd - SIP call media negotiation engine
//!
//! Builds SDP offers and answers, and runs loopback calls through the full
//! media state machine.

mod calling;
mod config;

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calling::call_test::{self, CallTestOptions};
use calling::media_attribute::{
    build_media_attributes_list, MediaAttribute, MediaMap, MediaType,
};
use calling::ports::PortReservation;
use calling::sdp::Sdp;
use calling::sdp_session::SdpSession;
use config::Config;

#[derive(Parser)]
#[command(name = "ringd")]
#[command(about = "SIP call media negotiation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an SDP offer
    Offer {
        /// Media maps as JSON, e.g. '[{"MEDIA_TYPE":"MEDIA_TYPE_AUDIO","LABEL":"audio_0"}]'
        #[arg(short, long)]
        media: Option<String>,

        /// Offer plain RTP instead of SRTP
        #[arg(long)]
        no_secure: bool,

        /// Advertise this address instead of the configured one
        #[arg(long)]
        publish: Option<IpAddr>,
    },

    /// Answer an SDP offer read from a file
    Answer {
        /// File holding the offer ("-" for stdin)
        offer: PathBuf,

        /// Media maps as JSON; default accepts every offered media
        #[arg(short, long)]
        media: Option<String>,
    },

    /// Place a loopback call between two local endpoints
    CallTest {
        /// Seconds to keep the call up once media started
        #[arg(short, long, default_value = "0")]
        duration: u64,

        /// Offer video too
        #[arg(long)]
        video: bool,

        /// Hold and resume the call once connected
        #[arg(long)]
        hold: bool,

        /// Negotiate ICE over loopback
        #[arg(long)]
        ice: bool,

        /// Callee declines the call
        #[arg(long)]
        refuse: bool,

        /// Mute the caller's video once connected (needs --video)
        #[arg(long)]
        mute_video: bool,

        /// Switch the caller's video input once connected
        #[arg(long, value_name = "URI")]
        switch_input: Option<String>,

        /// Callee adds video once connected
        #[arg(long)]
        add_video: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write it back to the configuration file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().context("Failed to load config")?,
    };

    match cli.command {
        Commands::Offer {
            media,
            no_secure,
            publish,
        } => {
            let secure = config.srtp_enabled && !no_secure;
            let media = parse_media(media.as_deref(), secure)?;
            let mut sdp = new_sdp("offer", &config);
            sdp.generate_media_ports()?;
            sdp.create_offer(&media)?;
            if let Some(addr) = publish {
                sdp.set_published_ip(addr);
            }
            let offer = sdp.local_session().context("No offer was built")?;
            print!("{}", offer);
        }
        Commands::Answer { offer, media } => {
            let text = if offer.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")?
            } else {
                fs::read_to_string(&offer)
                    .with_context(|| format!("Failed to read {}", offer.display()))?
            };
            let offer = SdpSession::parse(&text).context("Invalid SDP offer")?;

            let media = match media {
                Some(json) => parse_media(Some(&json), config.srtp_enabled)?,
                None => Sdp::get_media_attribute_list_from_sdp(&offer, true)
                    .into_iter()
                    .map(|attr| MediaAttribute {
                        secure: config.srtp_enabled,
                        muted: false,
                        on_hold: false,
                        ..attr
                    })
                    .collect(),
            };

            let mut sdp = new_sdp("answer", &config);
            sdp.generate_media_ports()?;
            sdp.set_received_offer(offer);
            sdp.process_incoming_offer(&media)?;
            sdp.start_negotiation().context("Negotiation failed")?;
            let answer = sdp.local_sdp_to_send().context("No answer was built")?;
            print!("{}", answer);
        }
        Commands::CallTest {
            duration,
            video,
            hold,
            ice,
            refuse,
            mute_video,
            switch_input,
            add_video,
        } => {
            anyhow::ensure!(video || !mute_video, "--mute-video needs --video");
            let mut call_config = config.call_config();
            call_config.ice_enabled = ice;
            call_config.stun_server = None;
            call_config.published_addr = Ipv4Addr::LOCALHOST.into();
            call_config.bind_address = Ipv4Addr::LOCALHOST.into();

            let options = CallTestOptions {
                duration: Duration::from_secs(duration),
                video,
                hold,
                refuse,
                mute_video,
                switch_input,
                add_video,
                ..CallTestOptions::default()
            };
            println!();
            println!("=== Loopback call test ===");
            println!("Video:    {}", video);
            println!("Hold:     {}", hold);
            println!("ICE:      {}", ice);
            println!("Duration: {}s", duration);
            println!();

            let result = call_test::run_call_test(&call_config, options).await?;
            call_test::print_result(&result);
        }
        Commands::Config { write } => {
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to serialize config")?
            );
            if write {
                match &cli.config {
                    Some(path) => config.save_to(path)?,
                    None => config.save()?,
                }
                eprintln!("Configuration saved");
            }
        }
    }

    Ok(())
}

fn new_sdp(id: &str, config: &Config) -> Sdp {
    let call = config.call_config();
    let mut sdp = Sdp::new(id, Arc::new(PortReservation::new()), call.published_addr)
        .with_port_ranges(call.audio_range, call.video_range);
    sdp.set_local_media_capabilities(MediaType::Audio, call.audio_codecs);
    sdp.set_local_media_capabilities(MediaType::Video, call.video_codecs);
    sdp
}

/// Media from `--media` JSON, audio only by default.
fn parse_media(json: Option<&str>, secure: bool) -> Result<Vec<MediaAttribute>> {
    let Some(json) = json else {
        return Ok(vec![MediaAttribute::new(MediaType::Audio)
            .with_label("audio_0")
            .with_secure(secure)]);
    };
    let maps: Vec<MediaMap> = serde_json::from_str(json).context("Invalid --media JSON")?;
    anyhow::ensure!(!maps.is_empty(), "--media must list at least one media");
    Ok(build_media_attributes_list(&maps, secure))
}

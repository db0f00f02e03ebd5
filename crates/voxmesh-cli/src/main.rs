#[cfg(feature = "capture")]
mod capture;
mod cli;
mod settings;

use std::collections::HashSet;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use voxmesh_common::{PeerId, VoiceError, VoxmeshError};
use voxmesh_config::{ConfigOrigin, VoxmeshConfig};
use voxmesh_rtc::{RemoteAudioPacket, RtcPeerEngine};
use voxmesh_voice::{
    HttpIceServerProvider, IceServerProvider, MediaCapability, NoCaptureDevice, SessionContext,
    VoiceDeps, VoiceEvent, VoiceSession,
};

fn init_logging(flag: Option<&str>, config: &VoxmeshConfig) {
    let directive = flag
        .map(str::to_string)
        .unwrap_or_else(|| format!("voxmesh={}", config.logging.level.as_filter()));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("voxmesh=info"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();

    let loaded = match voxmesh_config::load_config(args.config.as_deref().map(Path::new)) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("voxmesh: {e}");
            return ExitCode::FAILURE;
        }
    };
    let config = loaded.config;

    init_logging(args.log_level.as_deref(), &config);
    tracing::info!("Voxmesh v{} starting...", env!("CARGO_PKG_VERSION"));
    log_config_origin(&loaded.origin);

    match run(args, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: cli::Args, config: VoxmeshConfig) -> Result<ExitCode, VoxmeshError> {
    let token = args
        .token
        .clone()
        .or_else(|| std::env::var(cli::TOKEN_ENV).ok())
        .ok_or_else(|| {
            VoxmeshError::Other(format!("no token: pass --token or set ${}", cli::TOKEN_ENV))
        })?;

    let mut ctx = SessionContext::new(token.clone(), args.channel.clone());
    if let Some(raw) = args.peer_id.as_deref() {
        let peer = PeerId::normalize(raw);
        if !peer.is_valid() {
            return Err(VoxmeshError::Other(format!("invalid --peer-id {raw:?}")));
        }
        ctx = ctx.with_local_peer(peer);
    }

    let engine = Arc::new(RtcPeerEngine::new()?);
    tokio::spawn(log_remote_audio(engine.remote_audio()));

    let ice = match settings::ice_endpoint(&config.ice) {
        Some((url, timeout)) => {
            let provider = HttpIceServerProvider::new(url, timeout)?.with_bearer(token);
            Some(Arc::new(provider) as Arc<dyn IceServerProvider>)
        }
        None => None,
    };
    let deps = VoiceDeps {
        engine,
        media: media_capability(args.listen_only),
        ice,
    };

    let session_config = settings::session_config(&config, args.url.as_deref());
    let (session, mut events) = VoiceSession::join(session_config, ctx, deps);

    let mut exit = ExitCode::SUCCESS;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!("Failed to listen for Ctrl-C: {e}");
                }
                tracing::info!("Leaving channel {}", args.channel);
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    if is_terminal(&event) {
                        exit = ExitCode::FAILURE;
                    }
                    log_event(&event);
                }
                None => break,
            },
        }
    }

    session.leave().await;
    tracing::info!("Shutdown complete");
    Ok(exit)
}

fn log_config_origin(origin: &ConfigOrigin) {
    match origin {
        ConfigOrigin::File(path) => tracing::info!(path = %path.display(), "config loaded"),
        ConfigOrigin::Created(path) => {
            tracing::info!(path = %path.display(), "wrote default config")
        }
        ConfigOrigin::Fallback { path, error } => match path {
            Some(path) => {
                tracing::warn!(path = %path.display(), "config unusable, using defaults: {error}")
            }
            None => tracing::warn!("no config directory, using defaults"),
        },
    }
}

/// The microphone unless listening only or built without capture support.
fn media_capability(listen_only: bool) -> Arc<dyn MediaCapability> {
    if listen_only {
        return Arc::new(NoCaptureDevice);
    }
    #[cfg(feature = "capture")]
    let media: Arc<dyn MediaCapability> = Arc::new(capture::MicrophoneCapability);
    #[cfg(not(feature = "capture"))]
    let media: Arc<dyn MediaCapability> = {
        tracing::warn!("built without microphone support, joining receive-only");
        Arc::new(NoCaptureDevice)
    };
    media
}

/// Errors after which the session cannot recover by itself.
fn is_terminal(event: &VoiceEvent) -> bool {
    match event {
        VoiceEvent::Error(e) => {
            e.requires_sign_in() || matches!(e, VoiceError::TransportExhausted { .. })
        }
        _ => false,
    }
}

fn log_event(event: &VoiceEvent) {
    match event {
        VoiceEvent::StatusChanged(state) => tracing::info!(%state, "relay status"),
        VoiceEvent::Authenticated { local_id } => match local_id {
            Some(id) => tracing::info!(local_id = %id, "authenticated"),
            None => tracing::info!("authenticated"),
        },
        VoiceEvent::MemberJoined(peer) => tracing::info!(peer = %peer, "member joined"),
        VoiceEvent::MemberLeft(peer) => tracing::info!(peer = %peer, "member left"),
        VoiceEvent::SpeakingChanged { peer, is_speaking } => {
            tracing::info!(peer = %peer, is_speaking, "speaking")
        }
        VoiceEvent::ConnectionChanged { peer, state } => {
            tracing::info!(peer = %peer, %state, "connection")
        }
        VoiceEvent::Error(e) if e.is_user_visible() => tracing::error!("{e}"),
        VoiceEvent::Error(e) => tracing::warn!("{e}"),
    }
}

/// Audio decoding is left to the host; note when each member's audio starts.
async fn log_remote_audio(mut packets: broadcast::Receiver<RemoteAudioPacket>) {
    let mut heard = HashSet::new();
    loop {
        match packets.recv().await {
            Ok(packet) => {
                if heard.insert(packet.peer.clone()) {
                    tracing::info!(peer = %packet.peer, "receiving audio");
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unrecoverable_errors_are_terminal() {
        assert!(is_terminal(&VoiceEvent::Error(VoiceError::Auth("expired".into()))));
        assert!(is_terminal(&VoiceEvent::Error(
            VoiceError::TransportExhausted { attempts: 5 }
        )));
        assert!(!is_terminal(&VoiceEvent::Error(VoiceError::MediaAccess(
            "no capture device".into()
        ))));
        assert!(!is_terminal(&VoiceEvent::MemberJoined(PeerId::invalid())));
    }
}

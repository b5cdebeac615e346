use agentphone::backend::BackendClient;
use agentphone::call::CallEngine;
use agentphone::config::{BackendConfig, Cli, Config};
use agentphone::event::{create_event_sender, EventQueue, EventReceiver, UiEvent};
use agentphone::lock::{LockMonitor, LockStatusSource};
use agentphone::media::capture::CpalAudioBackend;
use agentphone::media::output::{CpalSink, NullSink};
use agentphone::media::rtc::RtcMediaTransport;
use agentphone::media::{build_ice_config, AudioSink, DeviceAccess};
use agentphone::useragent::{RegistrationManager, SipUserAgentBuilder};
use agentphone::{ui, version};
use anyhow::Result;
use clap::Parser;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};

/// Start a lock monitor whenever the engine reports a force-lock.
async fn watch_lock(
    mut events: EventReceiver,
    backend: Option<BackendClient>,
    queue: EventQueue,
    interval: Duration,
    token: CancellationToken,
) {
    let Some(backend) = backend else {
        token.cancelled().await;
        return;
    };
    let source: Arc<dyn LockStatusSource> = Arc::new(backend);
    let mut monitor: Option<CancellationToken> = None;
    loop {
        select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Ok(UiEvent::Locked) => {
                    let child = token.child_token();
                    if let Some(previous) = monitor.replace(child.clone()) {
                        previous.cancel();
                    }
                    tokio::spawn(LockMonitor::new(source.clone(), queue.clone(), interval, child).serve());
                }
                Ok(UiEvent::Unlocked) => {
                    if let Some(monitor) = monitor.take() {
                        monitor.cancel();
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.conf.as_deref() {
        Some(conf) if Path::new(conf).exists() => Config::load(conf)?,
        _ => Config::default(),
    };
    if let Some(url) = cli.backend {
        let mut backend = config.backend.take().unwrap_or(BackendConfig {
            url: String::new(),
            token: None,
            timeout_secs: None,
        });
        backend.url = url;
        config.backend = Some(backend);
    }

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }
    let mut _guard = None;
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _guard = Some(guard);
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }
    info!("{}", version::version_info());

    let backend = config.backend.as_ref().map(BackendClient::new).transpose()?;
    let mut ice_overrides = None;
    if let Some(client) = backend.as_ref() {
        match client.fetch_agent_config().await {
            Ok(agent) => config.agent.merge_missing(agent),
            Err(e) => warn!("failed to fetch agent config from backend: {}", e),
        }
        ice_overrides = client.fetch_ice_servers().await;
    }
    let identity = config.validate_agent_fields()?;
    let ice_servers = ice_overrides.unwrap_or_else(|| config.agent.ice_servers.clone());
    let ice = build_ice_config(&config.ice, Some(ice_servers.as_slice()));

    let token = CancellationToken::new();
    let ua_token = CancellationToken::new();
    let events = create_event_sender();
    let (queue, receiver) = mpsc::unbounded_channel();

    let useragent = Arc::new(
        SipUserAgentBuilder::new()
            .with_config(config.sip.clone())
            .with_identity(identity.clone())
            .with_cancel_token(ua_token.clone())
            .with_event_queue(queue.clone())
            .build()
            .await?,
    );
    let devices = DeviceAccess::new(
        Box::new(CpalAudioBackend::new()),
        config.agent.preferred_device_label.clone(),
    );
    let sink: Arc<dyn AudioSink> = match CpalSink::open_default() {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            warn!("no audio output available, remote audio is discarded: {}", e);
            Arc::new(NullSink::default())
        }
    };
    let engine = CallEngine::new(
        useragent.clone(),
        Arc::new(RtcMediaTransport::default()),
        devices,
        sink,
        ice,
        events.clone(),
        queue.clone(),
    );
    let registration = RegistrationManager::new(
        useragent.clone(),
        queue.clone(),
        &config.sip,
        &config.registration,
        token.child_token(),
    );

    info!(aor = identity.aor(), "starting agentphone");
    let ua_task = {
        let useragent = useragent.clone();
        tokio::spawn(async move {
            if let Err(e) = useragent.serve().await {
                error!("user agent stopped: {}", e);
            }
        })
    };
    let registration_task = tokio::spawn(async move { registration.serve().await });
    let engine_task = tokio::spawn(engine.serve(receiver, token.child_token()));

    select! {
        _ = ui::run_terminal(events.subscribe(), queue.clone(), token.clone()) => {
            info!("terminal closed, shutting down");
        }
        _ = watch_lock(
            events.subscribe(),
            backend,
            queue.clone(),
            Duration::from_secs(config.lock.poll_interval_secs.max(1)),
            token.clone(),
        ) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received CTRL+C, shutting down");
        }
    }

    token.cancel();
    engine_task.await.ok();
    registration_task.await.ok();
    useragent.stop();
    ua_task.await.ok();
    Ok(())
}

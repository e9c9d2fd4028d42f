//! Sessão MQTT – conexão única com o broker via `rumqttc`.
//!
//! ```text
//! main ──connect()──► MqttSession ──publish()──► AsyncClient
//!                          ▲                         │
//!                     Delivery (mpsc)                ▼
//!                          └──────── EventDriver ◄── EventLoop (task)
//! ```
//!
//! A conexão inicial é feita uma vez: qualquer falha antes do primeiro
//! CONNACK é fatal. Depois disso o `EventDriver` é dono do `EventLoop`,
//! mantém o flag de conexão e repassa os eventos de entrega para quem está
//! esperando o handshake do publish. Sem ninguém esperando, os eventos são
//! descartados.

use async_trait::async_trait;
use chrono::Local;
use cpuload_core::config::{AppConfig, Scheme};
use cpuload_core::types::QosLevel;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use rustls::ClientConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacidade da fila de requisições do `AsyncClient`.
const REQUEST_CAPACITY: usize = 10;
/// Keep-alive enviado no CONNECT.
const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Pausa entre uma falha do event loop e a próxima tentativa de poll.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Tempo máximo para o DISCONNECT sair no encerramento.
const DISCONNECT_QUIESCE: Duration = Duration::from_millis(250);
/// Eventos de entrega retidos enquanto um publish espera.
const DELIVERY_CAPACITY: usize = 16;

// ──────────────────────────────────────────────
// Erros
// ──────────────────────────────────────────────

/// Falha ao estabelecer a conexão inicial (fatal).
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Conexão recusada pelo broker: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("Erro de conexão: {0}")]
    Connection(#[from] ConnectionError),
}

/// Falha de um publish individual.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Falha ao enfileirar publish: {0}")]
    Client(#[from] ClientError),

    #[error("Entrega não confirmada: {0}")]
    Failed(String),

    #[error("Sessão MQTT encerrada")]
    SessionClosed,
}

// ──────────────────────────────────────────────
// Interfaces
// ──────────────────────────────────────────────

/// Ganchos de eventos da conexão.
pub trait ConnectionHooks: Send + Sync {
    fn on_connect(&self);
    fn on_connection_lost(&self, error: &str);
    /// Mensagem recebida. Este cliente não assina tópicos, então não deve disparar.
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Ganchos de produção: apenas registram no log.
pub struct LoggingHooks;

impl ConnectionHooks for LoggingHooks {
    fn on_connect(&self) {
        info!("Conectado");
    }

    fn on_connection_lost(&self, error: &str) {
        error!("Conexão perdida: {error}");
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        debug!("Mensagem ignorada em {topic} ({} bytes)", payload.len());
    }
}

/// O que o loop de publicação precisa do broker.
#[async_trait]
pub trait Broker: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Publica e espera o handshake do QoS completar.
    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), PublishError>;
}

// ──────────────────────────────────────────────
// Opções do cliente
// ──────────────────────────────────────────────

pub fn to_mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Monta as opções do `rumqttc` a partir da configuração.
///
/// Em WebSocket o `rumqttc` espera a URL completa no lugar do host.
pub fn mqtt_options(config: &AppConfig, tls: ClientConfig, client_id: String) -> MqttOptions {
    let host = match config.scheme {
        Scheme::Tls | Scheme::Tcp => config.broker.clone(),
        Scheme::Ws => format!("ws://{}:{}", config.broker, config.port),
        Scheme::Wss => format!("wss://{}:{}", config.broker, config.port),
    };
    let mut opts = MqttOptions::new(client_id, host, config.port);
    opts.set_keep_alive(KEEP_ALIVE);
    opts.set_credentials(config.username.clone(), config.password.clone());

    let rustls_config = || TlsConfiguration::Rustls(Arc::new(tls));
    match config.scheme {
        Scheme::Tcp => {}
        Scheme::Tls => {
            opts.set_transport(Transport::Tls(rustls_config()));
        }
        Scheme::Ws => {
            opts.set_transport(Transport::Ws);
        }
        Scheme::Wss => {
            opts.set_transport(Transport::Wss(rustls_config()));
        }
    }

    opts
}

// ──────────────────────────────────────────────
// Sessão
// ──────────────────────────────────────────────

/// Evento de entrega repassado pelo driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// PUBLISH escrito no socket (fim do handshake QoS 0)
    Written,
    /// PUBACK/PUBCOMP recebido (fim do handshake QoS 1/2)
    Acked,
    /// Conexão caiu com o publish em voo
    Failed(String),
}

/// Conexão única com o broker, compartilhada entre `main` e o loop.
pub struct MqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    waiting: Arc<AtomicBool>,
    deliveries: Mutex<mpsc::Receiver<Delivery>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MqttSession {
    /// Conecta ao broker e só retorna depois do primeiro CONNACK.
    pub async fn connect(
        config: &AppConfig,
        tls: ClientConfig,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Result<Self, ConnectError> {
        let client_id = config.client_id_at(&Local::now());
        debug!("Client id: {client_id}");

        let options = mqtt_options(config, tls, client_id);
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        wait_for_connack(&mut event_loop).await?;
        hooks.on_connect();

        let connected = Arc::new(AtomicBool::new(true));
        let waiting = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(DELIVERY_CAPACITY);
        let cancel = CancellationToken::new();

        let driver = EventDriver {
            connected: Arc::clone(&connected),
            waiting: Arc::clone(&waiting),
            hooks,
            deliveries: tx,
        };
        let handle = tokio::spawn(driver.run(event_loop, client.clone(), cancel.clone()));

        Ok(Self {
            client,
            connected,
            waiting,
            deliveries: Mutex::new(rx),
            driver: Mutex::new(Some(handle)),
            cancel,
        })
    }

    /// Envia DISCONNECT e encerra o driver.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.driver.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Driver MQTT terminou com erro: {e}");
            }
        }
        self.connected.store(false, Ordering::Release);
        info!("Sessão MQTT encerrada");
    }
}

#[async_trait]
impl Broker for MqttSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), PublishError> {
        let mut deliveries = self.deliveries.lock().await;

        // Eventos de ciclos anteriores não valem para este publish
        while deliveries.try_recv().is_ok() {}
        let _waiting = WaitingFlag::raise(&self.waiting);

        self.client
            .publish(topic, to_mqtt_qos(qos), retain, payload)
            .await?;

        await_delivery(&mut deliveries, qos).await
    }
}

/// Marca um publish em espera enquanto vivo.
struct WaitingFlag<'a>(&'a AtomicBool);

impl<'a> WaitingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for WaitingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match event_loop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(ConnectError::Refused(ack.code))
                };
            }
            other => trace!("Evento antes do CONNACK: {other:?}"),
        }
    }
}

/// Espera o evento que encerra o handshake do QoS, ou a falha da conexão.
async fn await_delivery(
    deliveries: &mut mpsc::Receiver<Delivery>,
    qos: QosLevel,
) -> Result<(), PublishError> {
    let expected = match qos {
        QosLevel::AtMostOnce => Delivery::Written,
        QosLevel::AtLeastOnce | QosLevel::ExactlyOnce => Delivery::Acked,
    };

    loop {
        match deliveries.recv().await {
            Some(Delivery::Failed(reason)) => return Err(PublishError::Failed(reason)),
            Some(event) if event == expected => return Ok(()),
            Some(_) => continue,
            None => return Err(PublishError::SessionClosed),
        }
    }
}

// ──────────────────────────────────────────────
// Driver do event loop
// ──────────────────────────────────────────────

struct EventDriver {
    connected: Arc<AtomicBool>,
    /// Há um publish esperando eventos de entrega
    waiting: Arc<AtomicBool>,
    hooks: Arc<dyn ConnectionHooks>,
    deliveries: mpsc::Sender<Delivery>,
}

impl EventDriver {
    async fn run(self, mut event_loop: EventLoop, client: AsyncClient, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown(&mut event_loop, &client).await;
                    return;
                }
                result = event_loop.poll() => match result {
                    Ok(event) => self.handle_event(&event),
                    Err(e) => {
                        self.connection_lost(&e.to_string());
                        // O próximo poll reconecta
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                },
            }
        }
    }

    fn handle_event(&self, event: &Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                if !self.connected.swap(true, Ordering::AcqRel) {
                    self.hooks.on_connect();
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.hooks.on_message(&publish.topic, &publish.payload);
            }
            Event::Incoming(Packet::PubAck(_)) | Event::Incoming(Packet::PubComp(_)) => {
                self.notify(Delivery::Acked);
            }
            Event::Incoming(Packet::Disconnect) => {
                self.connection_lost("desconectado pelo broker");
            }
            Event::Outgoing(Outgoing::Publish(_)) => {
                self.notify(Delivery::Written);
            }
            other => trace!("Evento MQTT: {other:?}"),
        }
    }

    fn connection_lost(&self, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.hooks.on_connection_lost(reason);
        } else {
            debug!("Reconexão falhou: {reason}");
        }
        self.notify(Delivery::Failed(reason.to_string()));
    }

    fn notify(&self, delivery: Delivery) {
        if !self.waiting.load(Ordering::Acquire) {
            trace!("Sem publish em espera, descartando {delivery:?}");
            return;
        }
        // Fila cheia ou sessão descartada: o evento não tem mais destino
        if let Err(e) = self.deliveries.try_send(delivery) {
            trace!("Evento de entrega descartado: {e}");
        }
    }

    async fn shutdown(&self, event_loop: &mut EventLoop, client: &AsyncClient) {
        self.connected.store(false, Ordering::Release);
        if let Err(e) = client.try_disconnect() {
            warn!("Erro ao enviar DISCONNECT: {e}");
            return;
        }

        let flushed = tokio::time::timeout(DISCONNECT_QUIESCE, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!("DISCONNECT não confirmado em {DISCONNECT_QUIESCE:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpuload_core::config::{DEFAULT_CA_FILE, Scheme};
    use rumqttc::{ConnAck, PubAck, PubComp, Publish};
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHooks {
        calls: StdMutex<Vec<String>>,
    }

    impl RecordingHooks {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ConnectionHooks for RecordingHooks {
        fn on_connect(&self) {
            self.calls.lock().unwrap().push("connect".into());
        }

        fn on_connection_lost(&self, error: &str) {
            self.calls.lock().unwrap().push(format!("lost:{error}"));
        }

        fn on_message(&self, topic: &str, _payload: &[u8]) {
            self.calls.lock().unwrap().push(format!("message:{topic}"));
        }
    }

    fn driver(connected: bool) -> (EventDriver, Arc<RecordingHooks>, mpsc::Receiver<Delivery>) {
        let hooks = Arc::new(RecordingHooks::default());
        let (tx, rx) = mpsc::channel(DELIVERY_CAPACITY);
        let driver = EventDriver {
            connected: Arc::new(AtomicBool::new(connected)),
            waiting: Arc::new(AtomicBool::new(true)),
            hooks: hooks.clone(),
            deliveries: tx,
        };
        (driver, hooks, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Delivery>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    fn sample_config(scheme: Scheme) -> AppConfig {
        AppConfig {
            broker: "broker.example.com".into(),
            port: 8883,
            protocol: "ssl".into(),
            scheme,
            tls_insecure_skip_verify: false,
            client_id: "cpuload-".into(),
            username: "user".into(),
            password: "secret".into(),
            topic: "base".into(),
            time_format: "%Y%m%d%H%M%S".into(),
            iid: "sensor-1".into(),
            key: "cpu".into(),
            value_round: 2,
            qos: QosLevel::AtLeastOnce,
            retain: false,
            heartbeat_interval: Duration::from_secs(5),
            ca_file: PathBuf::from(DEFAULT_CA_FILE),
        }
    }

    fn empty_tls() -> ClientConfig {
        ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth()
    }

    #[test]
    fn options_carry_identity_and_credentials() {
        let opts = mqtt_options(&sample_config(Scheme::Tls), empty_tls(), "cpuload-1".into());
        assert_eq!(opts.client_id(), "cpuload-1");
        assert_eq!(opts.broker_address(), ("broker.example.com".to_string(), 8883));
        assert_eq!(
            opts.credentials(),
            Some(("user".to_string(), "secret".to_string()))
        );
        assert!(matches!(opts.transport(), Transport::Tls(TlsConfiguration::Rustls(_))));
    }

    #[test]
    fn plain_tcp_skips_tls_transport() {
        let opts = mqtt_options(&sample_config(Scheme::Tcp), empty_tls(), "id".into());
        assert!(matches!(opts.transport(), Transport::Tcp));
    }

    #[test]
    fn websocket_uses_full_url() {
        let opts = mqtt_options(&sample_config(Scheme::Ws), empty_tls(), "id".into());
        assert_eq!(
            opts.broker_address(),
            ("ws://broker.example.com:8883".to_string(), 8883)
        );
        assert!(matches!(opts.transport(), Transport::Ws));

        let opts = mqtt_options(&sample_config(Scheme::Wss), empty_tls(), "id".into());
        assert_eq!(opts.broker_address().0, "wss://broker.example.com:8883");
        assert!(matches!(opts.transport(), Transport::Wss(TlsConfiguration::Rustls(_))));
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(to_mqtt_qos(QosLevel::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_mqtt_qos(QosLevel::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_mqtt_qos(QosLevel::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[test]
    fn reconnect_connack_fires_on_connect_once() {
        let (driver, hooks, _rx) = driver(false);
        let ack = Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)));
        driver.handle_event(&ack);
        driver.handle_event(&ack);
        assert!(driver.connected.load(Ordering::Acquire));
        assert_eq!(hooks.calls(), vec!["connect"]);
    }

    #[test]
    fn connection_loss_reports_once_and_fails_deliveries() {
        let (driver, hooks, mut rx) = driver(true);
        driver.connection_lost("reset");
        driver.connection_lost("refused");
        assert!(!driver.connected.load(Ordering::Acquire));
        assert_eq!(hooks.calls(), vec!["lost:reset"]);
        assert_eq!(rx.try_recv().unwrap(), Delivery::Failed("reset".into()));
        assert_eq!(rx.try_recv().unwrap(), Delivery::Failed("refused".into()));
    }

    #[test]
    fn failed_reconnects_without_waiter_are_dropped() {
        let (driver, hooks, mut rx) = driver(true);
        driver.waiting.store(false, Ordering::Release);
        for _ in 0..1000 {
            driver.connection_lost("refused");
        }
        assert_eq!(drain(&mut rx), 0);
        assert_eq!(hooks.calls(), vec!["lost:refused"]);
    }

    #[test]
    fn deliveries_stay_bounded_while_waiting() {
        let (driver, _hooks, mut rx) = driver(false);
        for _ in 0..1000 {
            driver.connection_lost("refused");
        }
        assert_eq!(drain(&mut rx), DELIVERY_CAPACITY);
    }

    #[test]
    fn waiting_flag_drops_with_the_guard() {
        let flag = AtomicBool::new(false);
        {
            let _waiting = WaitingFlag::raise(&flag);
            assert!(flag.load(Ordering::Acquire));
        }
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn broker_disconnect_marks_session_down() {
        let (driver, hooks, _rx) = driver(true);
        driver.handle_event(&Event::Incoming(Packet::Disconnect));
        assert!(!driver.connected.load(Ordering::Acquire));
        assert_eq!(hooks.calls(), vec!["lost:desconectado pelo broker"]);
    }

    #[test]
    fn incoming_publish_goes_to_message_hook() {
        let (driver, hooks, _rx) = driver(true);
        let publish = Publish::new("other/topic", QoS::AtMostOnce, "x");
        driver.handle_event(&Event::Incoming(Packet::Publish(publish)));
        assert_eq!(hooks.calls(), vec!["message:other/topic"]);
    }

    #[test]
    fn acks_and_writes_become_delivery_events() {
        let (driver, _hooks, mut rx) = driver(true);
        driver.handle_event(&Event::Outgoing(Outgoing::Publish(1)));
        driver.handle_event(&Event::Incoming(Packet::PubAck(PubAck::new(1))));
        driver.handle_event(&Event::Incoming(Packet::PubComp(PubComp::new(2))));
        assert_eq!(rx.try_recv().unwrap(), Delivery::Written);
        assert_eq!(rx.try_recv().unwrap(), Delivery::Acked);
        assert_eq!(rx.try_recv().unwrap(), Delivery::Acked);
    }

    #[tokio::test]
    async fn qos0_completes_on_write() {
        let (tx, mut rx) = mpsc::channel(DELIVERY_CAPACITY);
        tx.try_send(Delivery::Written).unwrap();
        assert!(await_delivery(&mut rx, QosLevel::AtMostOnce).await.is_ok());
    }

    #[tokio::test]
    async fn qos1_waits_for_ack() {
        let (tx, mut rx) = mpsc::channel(DELIVERY_CAPACITY);
        tx.try_send(Delivery::Written).unwrap();
        tx.try_send(Delivery::Acked).unwrap();
        assert!(await_delivery(&mut rx, QosLevel::AtLeastOnce).await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failure_ends_the_wait() {
        let (tx, mut rx) = mpsc::channel(DELIVERY_CAPACITY);
        tx.try_send(Delivery::Written).unwrap();
        tx.try_send(Delivery::Failed("reset".into())).unwrap();
        assert!(matches!(
            await_delivery(&mut rx, QosLevel::ExactlyOnce).await,
            Err(PublishError::Failed(reason)) if reason == "reset"
        ));
    }

    #[tokio::test]
    async fn closed_channel_ends_the_wait() {
        let (tx, mut rx) = mpsc::channel::<Delivery>(DELIVERY_CAPACITY);
        drop(tx);
        assert!(matches!(
            await_delivery(&mut rx, QosLevel::AtMostOnce).await,
            Err(PublishError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_connect() {
        let mut config = sample_config(Scheme::Tcp);
        config.broker = "127.0.0.1".into();
        config.port = 1;
        let hooks = Arc::new(RecordingHooks::default());
        let result = MqttSession::connect(&config, empty_tls(), hooks.clone()).await;
        assert!(matches!(result, Err(ConnectError::Connection(_))));
        assert!(hooks.calls().is_empty());
    }
}

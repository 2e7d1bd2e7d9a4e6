//! Метрики для мониторинга в формате Prometheus (RED: Rate, Errors, Duration).
//!
//! Счётчики ведутся по имени операции из `Operation::name`.

use crate::ldap_protocol::ResultCode;
use anyhow::{Context, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Операции, для которых ведутся счётчики и гистограммы.
const OPERATIONS: [&str; 8] = [
    "bind", "search", "add", "modify", "delete", "modify_dn", "compare", "extended",
];

/// Верхние границы корзин гистограммы длительности (в секундах). +Inf даётся отдельно как count.
const DURATION_BUCKETS: [f64; 11] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Гистограмма для одной операции: корзины + счётчик + сумма (в микросекундах).
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        // Некумулятивное хранение: только первая корзина, для которой secs <= le.
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct OperationCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    intercepted: AtomicU64,
    duration: DurationHistogram,
}

/// Счётчики метрик (thread-safe, lock-free кроме карты результатов).
#[derive(Debug, Default)]
pub struct Metrics {
    /// Всего принятых клиентских подключений.
    pub connections_total: AtomicU64,
    /// Открытые сейчас подключения.
    pub connections_active: AtomicU64,
    /// Ошибки разбора LDAP-сообщений (невалидный BER, превышен размер).
    pub parse_errors: AtomicU64,
    /// Записи, отправленные клиентам в ответах на поиск.
    pub entries_returned: AtomicU64,
    /// Успешные переходы на TLS через StartTLS.
    pub start_tls_total: AtomicU64,
    /// Запросы, ошибки и длительность по типам операций (порядок как в `OPERATIONS`).
    operations: [OperationCounters; 8],
    /// (операция, имя кода результата) -> количество.
    results: dashmap::DashMap<(&'static str, &'static str), AtomicU64>,
}

/// Состояние для GET /ready.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyState {
    pub ready: bool,
    pub entries: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn operation(&self, op: &str) -> Option<&OperationCounters> {
        OPERATIONS.iter().position(|o| *o == op).map(|i| &self.operations[i])
    }

    /// Новое клиентское подключение: растут и общий счётчик, и gauge открытых.
    #[inline]
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        // Насыщающее вычитание: лишний close не должен переполнить gauge.
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Увеличивает счётчик запросов по типу операции.
    #[inline]
    pub fn inc_request(&self, op: &str) {
        if let Some(c) = self.operation(op) {
            c.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Увеличивает счётчик ошибок по типу операции (любой код, кроме успешных).
    #[inline]
    pub fn inc_error(&self, op: &str) {
        if let Some(c) = self.operation(op) {
            c.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Запрос, на который ответил интерсептор, а не каталог.
    #[inline]
    pub fn inc_intercepted(&self, op: &str) {
        if let Some(c) = self.operation(op) {
            c.intercepted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Учитывает код результата ответа для пары (операция, код).
    pub fn inc_result(&self, op: &str, code: ResultCode) {
        let Some(op) = OPERATIONS.iter().copied().find(|o| *o == op) else {
            return;
        };
        self.results
            .entry((op, code.name()))
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Учитывает длительность запроса (RED: Duration).
    #[inline]
    pub fn observe_duration(&self, op: &str, duration: Duration) {
        if let Some(c) = self.operation(op) {
            c.duration.observe(duration);
        }
    }

    /// Увеличивает счётчик ошибок разбора (невалидный BER, превышен размер и т.д.).
    #[inline]
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_entries_returned(&self, n: u64) {
        self.entries_returned.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_start_tls(&self) {
        self.start_tls_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Рендер метрик в текстовом формате Prometheus (exposition format).
    /// `directory_entries`: текущее число записей в дереве.
    pub fn render(&self, directory_entries: usize) -> String {
        let mut out = String::new();
        let mut scalar = |name: &str, kind: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP ldap_server_{} {}\n", name, help));
            out.push_str(&format!("# TYPE ldap_server_{} {}\n", name, kind));
            out.push_str(&format!("ldap_server_{} {}\n", name, value));
        };
        scalar(
            "connections_total",
            "counter",
            "Total number of client connections accepted.",
            self.connections_total.load(Ordering::Relaxed),
        );
        scalar(
            "connections_active",
            "gauge",
            "Client connections currently open.",
            self.connections_active.load(Ordering::Relaxed),
        );
        scalar(
            "parse_errors_total",
            "counter",
            "Total number of LDAP message parse errors (invalid BER / oversized PDU).",
            self.parse_errors.load(Ordering::Relaxed),
        );
        scalar(
            "entries_returned_total",
            "counter",
            "Search result entries sent to clients.",
            self.entries_returned.load(Ordering::Relaxed),
        );
        scalar(
            "start_tls_total",
            "counter",
            "Successful StartTLS upgrades.",
            self.start_tls_total.load(Ordering::Relaxed),
        );
        scalar(
            "directory_entries",
            "gauge",
            "Entries currently held in the directory.",
            directory_entries as u64,
        );

        let per_op = |out: &mut String, name: &str, help: &str, pick: fn(&OperationCounters) -> u64| {
            out.push_str(&format!("# HELP ldap_server_{} {}\n", name, help));
            out.push_str(&format!("# TYPE ldap_server_{} counter\n", name));
            for (op, counters) in OPERATIONS.iter().zip(&self.operations) {
                let value = pick(counters);
                out.push_str(&format!("ldap_server_{}{{op=\"{}\"}} {}\n", name, op, value));
            }
        };
        per_op(&mut out, "requests_total", "Total LDAP requests by operation.", |c| c.requests.load(Ordering::Relaxed));
        per_op(
            &mut out,
            "errors_total",
            "Requests that did not complete successfully, by operation.",
            |c| c.errors.load(Ordering::Relaxed),
        );
        per_op(
            &mut out,
            "intercepted_total",
            "Requests answered by an interceptor, by operation.",
            |c| c.intercepted.load(Ordering::Relaxed),
        );

        out.push_str("# HELP ldap_server_results_total Responses by operation and result code.\n");
        out.push_str("# TYPE ldap_server_results_total counter\n");
        let mut results: Vec<_> = self
            .results
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        results.sort();
        for ((op, code), count) in results {
            out.push_str(&format!(
                "ldap_server_results_total{{op=\"{}\",code=\"{}\"}} {}\n",
                op, code, count
            ));
        }

        // RED: Duration: гистограмма длительности запросов по операциям
        out.push_str("# HELP ldap_server_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_server_request_duration_seconds histogram\n");
        for (op, counters) in OPERATIONS.iter().zip(&self.operations) {
            let hist = &counters.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_server_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_server_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_server_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_server_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}

/// Извлекает путь из первой строки HTTP-запроса (например "GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let mut parts = first_line.trim().split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

pub type ReadyProbe = Arc<dyn Fn() -> ReadyState + Send + Sync>;

/// Запускает HTTP-сервер для эндпоинтов GET /metrics, GET /health, GET /ready.
pub async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>, probe: ReadyProbe) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;
    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;
    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);
    serve_metrics(listener, metrics, probe).await
}

/// Цикл приёма соединений на уже привязанном листенере.
/// - /health (liveness): 200 если процесс жив.
/// - /ready (readiness): 200 когда LDAP-листенер поднят, иначе 503.
pub async fn serve_metrics(listener: TcpListener, metrics: Arc<Metrics>, probe: ReadyProbe) -> Result<()> {
    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let probe = Arc::clone(&probe);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");

            let (status, body, content_type) = match path {
                "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
                "/ready" => {
                    let state = probe();
                    let body = serde_json::to_string(&state)
                        .unwrap_or_else(|_| r#"{"ready":false,"entries":0}"#.to_string());
                    let status = if state.ready { "200 OK" } else { "503 Service Unavailable" };
                    (status, body, "application/json")
                }
                "/metrics" => {
                    let state = probe();
                    ("200 OK", metrics.render(state.entries), "text/plain; version=0.0.4; charset=utf-8")
                }
                _ => (
                    "404 Not Found",
                    "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
                    "text/plain; charset=utf-8",
                ),
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[test]
    fn test_request_path() {
        assert_eq!(request_path("GET /health HTTP/1.1"), "/health");
        assert_eq!(request_path("GET /ready HTTP/1.0"), "/ready");
        assert_eq!(request_path(""), "");
        assert_eq!(request_path("GET  HTTP/1.1"), "");
    }

    #[test]
    fn test_render_counters() {
        let m = Metrics::new();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        m.inc_request("search");
        m.inc_request("search");
        m.inc_error("bind");
        m.inc_result("search", ResultCode::Success);
        m.inc_result("bind", ResultCode::InvalidCredentials);
        m.inc_result("nonsense", ResultCode::Success);
        m.add_entries_returned(3);
        m.observe_duration("search", Duration::from_millis(2));

        let out = m.render(12);
        assert!(out.contains("ldap_server_connections_total 2\n"));
        assert!(out.contains("ldap_server_connections_active 1\n"));
        assert!(out.contains("ldap_server_directory_entries 12\n"));
        assert!(out.contains("ldap_server_entries_returned_total 3\n"));
        assert!(out.contains("ldap_server_requests_total{op=\"search\"} 2\n"));
        assert!(out.contains("ldap_server_errors_total{op=\"bind\"} 1\n"));
        assert!(out.contains("ldap_server_results_total{op=\"bind\",code=\"invalidCredentials\"} 1\n"));
        assert!(!out.contains("nonsense"));
        assert!(out.contains("ldap_server_request_duration_seconds_bucket{op=\"search\",le=\"0.0025\"} 1\n"));
        assert!(out.contains("ldap_server_request_duration_seconds_bucket{op=\"search\",le=\"0.001\"} 0\n"));
        assert!(out.contains("ldap_server_request_duration_seconds_count{op=\"search\"} 1\n"));
    }

    #[test]
    fn test_active_gauge_does_not_wrap() {
        let m = Metrics::new();
        m.connection_closed();
        assert_eq!(m.connections_active.load(Ordering::Relaxed), 0);
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_http_endpoints() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(Metrics::new());
        metrics.inc_request("bind");
        let probe: ReadyProbe = Arc::new(|| ReadyState { ready: true, entries: 4 });
        tokio::spawn(serve_metrics(listener, metrics, probe));

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200 OK"));
        assert!(health.ends_with("ok"));

        let ready = get(addr, "/ready").await;
        assert!(ready.starts_with("HTTP/1.1 200 OK"));
        assert!(ready.ends_with(r#"{"ready":true,"entries":4}"#));

        let body = get(addr, "/metrics").await;
        assert!(body.contains("ldap_server_requests_total{op=\"bind\"} 1"));
        assert!(body.contains("ldap_server_directory_entries 4"));

        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));
    }
}

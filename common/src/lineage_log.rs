//! Extracción de eventos de lineage del log de un job: el listener los
//! escribe por consola, a veces partidos en varias líneas.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

pub const CONSOLE_TRANSPORT_MARKER: &str =
    "INFO [spark-listener-group-shared] transports.ConsoleTransport ";

/// Máximo de fragmentos que se juntan antes de descartar un evento.
pub const MAX_FRAGMENTS: usize = 16;

/// Lo único que se lee de un evento; el resto queda opaco.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEventSummary {
    pub run_id: String,
    pub event_type: String,
    pub event_time: String,
    pub job_name: String,
}

impl RunEventSummary {
    pub fn from_value(v: &Value) -> Option<Self> {
        let text = |ptr: &str| v.pointer(ptr).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            run_id: text("/run/runId")?,
            event_type: text("/eventType")?,
            event_time: text("/eventTime")?,
            job_name: text("/job/name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    /// JSON tal cual salió del log (reensamblado si venía partido).
    pub raw: String,
    pub summary: RunEventSummary,
}

/// Lo que sigue al marcador, desde la primera `{`.
pub fn event_fragment(line: &str) -> Option<&str> {
    let start = line.find(CONSOLE_TRANSPORT_MARKER)? + CONSOLE_TRANSPORT_MARKER.len();
    let brace = line[start..].find('{')?;
    Some(&line[start + brace..])
}

fn parse(raw: &str) -> Option<Value> {
    serde_json::from_str(raw).ok()
}

fn summarize(raw: String, value: &Value) -> Option<RunEvent> {
    match RunEventSummary::from_value(value) {
        Some(summary) => Some(RunEvent { raw, summary }),
        None => {
            warn!("evento sin run/eventType/eventTime/job, se ignora");
            None
        }
    }
}

/// Recorre las líneas y devuelve los eventos completos en orden.
///
/// Un fragmento que no parsea se completa con los siguientes hasta que
/// parsee o se llegue a `MAX_FRAGMENTS`.
pub fn extract_run_events<'a, I>(lines: I) -> Vec<RunEvent>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut events = Vec::new();
    let mut pending: Vec<&str> = Vec::new();

    for line in lines {
        let Some(fragment) = event_fragment(line) else {
            continue;
        };
        pending.push(fragment);
        let raw = pending.concat();

        match parse(&raw) {
            Some(value) => {
                if pending.len() > 1 {
                    debug!("evento reensamblado de {} fragmentos", pending.len());
                }
                events.extend(summarize(raw, &value));
                pending.clear();
            }
            None if pending.len() >= MAX_FRAGMENTS => {
                warn!("no se pudo reensamblar un evento de {} fragmentos, se descarta", pending.len());
                pending.clear();
            }
            None => {}
        }
    }

    if !pending.is_empty() {
        warn!("el log terminó con un evento incompleto ({} fragmentos)", pending.len());
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(json: &str) -> String {
        format!("24/03/01 10:00:00 {CONSOLE_TRANSPORT_MARKER}{json}")
    }

    const EVENT: &str = r#"{"eventType":"COMPLETE","eventTime":"2024-03-01T10:00:00.123Z","run":{"runId":"0f9c-1"},"job":{"namespace":"default","name":"inventory_insights"},"inputs":[]}"#;

    #[test]
    fn evento_en_una_linea() {
        let lines = vec![
            "otra cosa".to_string(),
            line(EVENT),
            "INFO algo sin marcador {\"x\":1}".to_string(),
        ];
        let events = extract_run_events(lines.iter().map(String::as_str));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].raw, EVENT);
        assert_eq!(
            events[0].summary,
            RunEventSummary {
                run_id: "0f9c-1".into(),
                event_type: "COMPLETE".into(),
                event_time: "2024-03-01T10:00:00.123Z".into(),
                job_name: "inventory_insights".into(),
            }
        );
    }

    #[test]
    fn evento_partido_se_reensambla() {
        // cada continuación arranca en una llave, como las escribe el listener
        let (a, rest) = EVENT.split_at(EVENT.find(r#"{"runId""#).unwrap());
        let (b, c) = rest.split_at(rest.find(r#"{"namespace""#).unwrap());
        let lines = vec![line(a), "ruido".to_string(), line(b), line(c)];

        let events = extract_run_events(lines.iter().map(String::as_str));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].raw, EVENT);
        assert_eq!(events[0].summary.job_name, "inventory_insights");
    }

    #[test]
    fn fragmentos_de_mas_se_descartan_y_se_sigue() {
        let mut lines: Vec<String> = (0..MAX_FRAGMENTS).map(|_| line(r#"{"a":"#)).collect();
        lines.push(line(EVENT));

        let events = extract_run_events(lines.iter().map(String::as_str));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].summary.run_id, "0f9c-1");
    }

    #[test]
    fn marcador_sin_json_se_ignora() {
        assert_eq!(event_fragment(&format!("x {CONSOLE_TRANSPORT_MARKER}sin llaves")), None);
        assert_eq!(event_fragment("nada"), None);
    }
}

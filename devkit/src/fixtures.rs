/*!
Types cloud d'exemple pour les tests

- `samples.Counter` : le compteur embarqué dans nimbus-host (archive)
- `fixtures.Recorder` : unité seule, champ transitoire réinitialisé et deux hooks ordonnés
- `fixtures.Gated` : hook de migration qui bloque jusqu'à ouverture d'une `Gate`
*/

use nimbus_core::{CloudObject, CodeProvider, FieldError, InvocationContext, TypeCatalog, TypeDescriptor};
use nimbus_host::catalog::{sample_code, Counter, COUNTER, SAMPLES_ARCHIVE};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tokio::sync::Notify;

pub const RECORDER: &str = "fixtures.Recorder";
pub const GATED: &str = "fixtures.Gated";

/// Value a transient `cache` field takes on after a migration
pub const FRESH_CACHE: &[u8] = b"fresh";

fn json_list(items: &[String]) -> Vec<u8> {
    serde_json::to_vec(items).unwrap_or_default()
}

#[derive(Default)]
struct RecorderState {
    calls: Vec<String>,
    hook_log: Vec<String>,
    cache: Option<String>,
}

/// Remembers every `record` call and every migration hook it ran
#[derive(Default)]
pub struct Recorder {
    state: Mutex<RecorderState>,
}

impl CloudObject for Recorder {
    fn invoke(&self, method: &str, params: &[Vec<u8>], _: &[String], ctx: &InvocationContext) -> Result<Vec<u8>, String> {
        match method {
            "record" => {
                let entry = params.first().map(|p| String::from_utf8_lossy(p).into_owned()).unwrap_or_default();
                let mut state = self.state.lock();
                state.cache = Some(entry.clone());
                state.calls.push(entry);
                Ok(state.calls.len().to_string().into_bytes())
            }
            "shout" => {
                ctx.println("to stdout");
                ctx.eprintln("to stderr");
                Ok(Vec::new())
            }
            "fail" => Err("requested failure".into()),
            other => Err(format!("Recorder has no method {other}")),
        }
    }

    fn field(&self, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        match name {
            "calls" => Some(json_list(&state.calls)),
            "hook_log" => Some(json_list(&state.hook_log)),
            "cache" => Some(state.cache.clone().unwrap_or_default().into_bytes()),
            _ => None,
        }
    }

    fn set_field(&self, name: &str, value: &[u8]) -> Result<(), FieldError> {
        let mut state = self.state.lock();
        let parse = |v: &[u8]| serde_json::from_slice::<Vec<String>>(v).map_err(|e| FieldError::Rejected(e.to_string()));
        match name {
            "calls" => state.calls = parse(value)?,
            "hook_log" => state.hook_log = parse(value)?,
            "cache" => state.cache = (!value.is_empty()).then(|| String::from_utf8_lossy(value).into_owned()),
            _ => return Err(FieldError::Unknown),
        }
        Ok(())
    }

    fn reset_field(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        match name {
            "calls" => state.calls.clear(),
            "hook_log" => state.hook_log.clear(),
            "cache" => state.cache = None,
            _ => return false,
        }
        true
    }

    fn field_names(&self) -> Vec<String> {
        vec!["calls".into(), "hook_log".into(), "cache".into()]
    }

    fn run_hook(&self, hook: &str) -> Result<(), String> {
        match hook {
            "seal" | "stamp" => {
                self.state.lock().hook_log.push(hook.to_string());
                Ok(())
            }
            other => Err(format!("Recorder has no hook {other}")),
        }
    }
}

/// Holds migration hooks until a test opens it
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
    entered: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    /// Resolves once a hook is parked at the gate
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    fn pass(&self) {
        self.entered.notify_one();
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }
}

/// Object whose `hold` migration hook waits at a [`Gate`]
pub struct GatedHook {
    gate: Arc<Gate>,
    value: Mutex<Vec<u8>>,
}

impl CloudObject for GatedHook {
    fn invoke(&self, method: &str, params: &[Vec<u8>], _: &[String], _: &InvocationContext) -> Result<Vec<u8>, String> {
        match method {
            "get" => Ok(self.value.lock().clone()),
            "set" => {
                *self.value.lock() = params.first().cloned().unwrap_or_default();
                Ok(Vec::new())
            }
            other => Err(format!("Gated has no method {other}")),
        }
    }

    fn field(&self, name: &str) -> Option<Vec<u8>> {
        (name == "value").then(|| self.value.lock().clone())
    }

    fn set_field(&self, name: &str, value: &[u8]) -> Result<(), FieldError> {
        if name != "value" {
            return Err(FieldError::Unknown);
        }
        *self.value.lock() = value.to_vec();
        Ok(())
    }

    fn reset_field(&self, name: &str) -> bool {
        self.set_field(name, &[]).is_ok()
    }

    fn field_names(&self) -> Vec<String> {
        vec!["value".into()]
    }

    fn run_hook(&self, hook: &str) -> Result<(), String> {
        match hook {
            "hold" => {
                self.gate.pass();
                Ok(())
            }
            other => Err(format!("Gated has no hook {other}")),
        }
    }
}

pub fn fixture_catalog(gate: Arc<Gate>) -> Arc<TypeCatalog> {
    let mut catalog = TypeCatalog::new();
    catalog.register_fn(
        TypeDescriptor::builder(COUNTER)
            .archive(SAMPLES_ARCHIVE)
            .transient("last_report")
            .hook("flush", 10)
            .build(),
        |_, params, _| {
            let counter = Counter::default();
            if let Some(initial) = params.first() {
                counter.set_field("count", initial).map_err(|e| format!("bad initial count: {e:?}"))?;
            }
            Ok(Arc::new(counter) as Arc<dyn CloudObject>)
        },
    );
    catalog.register_fn(
        TypeDescriptor::builder(RECORDER)
            .transient_with("cache", || FRESH_CACHE.to_vec())
            .hook("stamp", 5)
            .hook("seal", 1)
            .build(),
        |_, _, _| Ok(Arc::new(Recorder::default()) as Arc<dyn CloudObject>),
    );
    catalog.register_fn(TypeDescriptor::builder(GATED).hook_default("hold").build(), move |_, _, _| {
        Ok(Arc::new(GatedHook { gate: gate.clone(), value: Mutex::new(Vec::new()) }) as Arc<dyn CloudObject>)
    });
    Arc::new(catalog)
}

/// Code the test client serves: the samples archive plus one unit per fixture
pub fn fixture_code() -> CodeProvider {
    let mut provider = sample_code();
    provider.register_unit(RECORDER, b"recorder".to_vec());
    provider.register_unit(GATED, b"gated".to_vec());
    provider
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_fields_are_json_lists() {
        let recorder = Recorder::default();
        recorder.set_field("calls", br#"["a","b"]"#).unwrap();
        assert_eq!(recorder.field("calls").unwrap(), br#"["a","b"]"#);
        assert!(matches!(recorder.set_field("calls", b"nope"), Err(FieldError::Rejected(_))));

        recorder.run_hook("seal").unwrap();
        assert_eq!(recorder.field("hook_log").unwrap(), br#"["seal"]"#);
        assert!(recorder.run_hook("other").is_err());
    }

    #[test]
    fn catalog_and_code_cover_every_fixture() {
        let catalog = fixture_catalog(Gate::new());
        assert_eq!(catalog.len(), 3);
        let hooks: Vec<_> = catalog
            .get(RECORDER)
            .unwrap()
            .descriptor
            .migration_hooks
            .iter()
            .map(|h| h.name.clone())
            .collect();
        assert_eq!(hooks, vec!["seal", "stamp"]);
        assert!(!fixture_code().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gate_holds_until_opened() {
        let gate = Gate::new();
        let held = gate.clone();
        let hook = tokio::task::spawn_blocking(move || held.pass());

        gate.entered().await;
        assert!(!hook.is_finished());
        gate.open();
        hook.await.unwrap();
    }
}

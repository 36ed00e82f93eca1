//! Cloud types compiled into this host binary.
//!
//! Both ship in the `samples.car` archive the kernel serves; a host only
//! builds an instance once the archive has been transferred to it.

use nimbus_core::{CloudObject, CodeProvider, FieldError, InvocationContext, TypeCatalog, TypeDescriptor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const SAMPLES_ARCHIVE: &str = "samples.car";
pub const COUNTER: &str = "samples.Counter";
pub const SLEEPER: &str = "samples.Sleeper";

fn decode_u64(bytes: &[u8]) -> Result<u64, String> {
    std::str::from_utf8(bytes)
        .map_err(|e| e.to_string())?
        .trim()
        .parse()
        .map_err(|e| format!("not a number: {e}"))
}

fn encode_u64(value: u64) -> Vec<u8> {
    value.to_string().into_bytes()
}

#[derive(Default)]
struct CounterState {
    count: u64,
    /// Rebuilt lazily, reset on migration
    last_report: Option<String>,
}

/// Counter with a transient report cache and a `flush` migration hook
#[derive(Default)]
pub struct Counter {
    state: Mutex<CounterState>,
}

impl CloudObject for Counter {
    fn invoke(&self, method: &str, params: &[Vec<u8>], _: &[String], ctx: &InvocationContext) -> Result<Vec<u8>, String> {
        match method {
            "increment" => {
                let mut state = self.state.lock();
                state.count += 1;
                Ok(encode_u64(state.count))
            }
            "add" => {
                let n = decode_u64(params.first().ok_or("add needs one argument")?)?;
                let mut state = self.state.lock();
                state.count = state.count.checked_add(n).ok_or("counter overflow")?;
                Ok(encode_u64(state.count))
            }
            "get" => Ok(encode_u64(self.state.lock().count)),
            "report" => {
                let mut state = self.state.lock();
                let report = format!("count is {}", state.count);
                ctx.println(report.clone());
                state.last_report = Some(report.clone());
                Ok(report.into_bytes())
            }
            other => Err(format!("Counter has no method {other}")),
        }
    }

    fn field(&self, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        match name {
            "count" => Some(encode_u64(state.count)),
            "last_report" => Some(state.last_report.clone().unwrap_or_default().into_bytes()),
            _ => None,
        }
    }

    fn set_field(&self, name: &str, value: &[u8]) -> Result<(), FieldError> {
        let mut state = self.state.lock();
        match name {
            "count" => {
                state.count = decode_u64(value).map_err(FieldError::Rejected)?;
                Ok(())
            }
            "last_report" => {
                state.last_report = (!value.is_empty()).then(|| String::from_utf8_lossy(value).into_owned());
                Ok(())
            }
            _ => Err(FieldError::Unknown),
        }
    }

    fn reset_field(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        match name {
            "count" => state.count = 0,
            "last_report" => state.last_report = None,
            _ => return false,
        }
        true
    }

    fn field_names(&self) -> Vec<String> {
        vec!["count".into(), "last_report".into()]
    }

    fn run_hook(&self, hook: &str) -> Result<(), String> {
        match hook {
            "flush" => {
                self.state.lock().last_report = None;
                Ok(())
            }
            other => Err(format!("Counter has no hook {other}")),
        }
    }
}

/// Sleeps in small steps, parking at each step while suspended
#[derive(Default)]
pub struct Sleeper {
    naps: Mutex<u64>,
}

impl CloudObject for Sleeper {
    fn invoke(&self, method: &str, params: &[Vec<u8>], _: &[String], ctx: &InvocationContext) -> Result<Vec<u8>, String> {
        match method {
            "sleep" => {
                let millis = decode_u64(params.first().ok_or("sleep needs a duration")?)?;
                let mut slept = 0;
                while slept < millis {
                    if !ctx.checkpoint() {
                        return Err("interrupted".into());
                    }
                    let step = (millis - slept).min(10);
                    std::thread::sleep(Duration::from_millis(step));
                    slept += step;
                }
                *self.naps.lock() += 1;
                Ok(encode_u64(slept))
            }
            other => Err(format!("Sleeper has no method {other}")),
        }
    }

    fn field(&self, name: &str) -> Option<Vec<u8>> {
        (name == "naps").then(|| encode_u64(*self.naps.lock()))
    }

    fn set_field(&self, name: &str, value: &[u8]) -> Result<(), FieldError> {
        if name != "naps" {
            return Err(FieldError::Unknown);
        }
        *self.naps.lock() = decode_u64(value).map_err(FieldError::Rejected)?;
        Ok(())
    }

    fn reset_field(&self, name: &str) -> bool {
        if name != "naps" {
            return false;
        }
        *self.naps.lock() = 0;
        true
    }

    fn field_names(&self) -> Vec<String> {
        vec!["naps".into()]
    }
}

pub fn sample_catalog() -> Arc<TypeCatalog> {
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
                counter.state.lock().count = decode_u64(initial)?;
            }
            Ok(Arc::new(counter) as Arc<dyn CloudObject>)
        },
    );
    catalog.register_fn(TypeDescriptor::builder(SLEEPER).archive(SAMPLES_ARCHIVE).build(), |_, _, _| {
        Ok(Arc::new(Sleeper::default()) as Arc<dyn CloudObject>)
    });
    Arc::new(catalog)
}

/// Code the kernel serves for the sample types
pub fn sample_code() -> CodeProvider {
    let mut provider = CodeProvider::new();
    let manifest = format!("{COUNTER}\n{SLEEPER}\n");
    provider.register_archive(SAMPLES_ARCHIVE, manifest.into_bytes(), &[COUNTER, SLEEPER]);
    provider
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_fields_are_decimal_text() {
        let counter = Counter::default();
        counter.set_field("count", b"41").unwrap();
        assert_eq!(counter.field("count").unwrap(), b"41");
        assert!(matches!(counter.set_field("count", b"x"), Err(FieldError::Rejected(_))));
        assert_eq!(counter.set_field("nope", b"1"), Err(FieldError::Unknown));
    }

    #[test]
    fn flush_hook_clears_the_report_cache() {
        let counter = Counter::default();
        counter.set_field("last_report", b"count is 3").unwrap();
        counter.run_hook("flush").unwrap();
        assert_eq!(counter.field("last_report").unwrap(), b"");
        assert!(counter.run_hook("other").is_err());
    }

    #[test]
    fn catalog_lists_the_sample_types() {
        let catalog = sample_catalog();
        assert_eq!(catalog.type_names(), vec![COUNTER.to_string(), SLEEPER.to_string()]);
        assert_eq!(sample_code().len(), 3);
    }
}

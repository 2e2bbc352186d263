#![allow(dead_code, unused_macros)]

use std::time::Duration;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Polls `condition` every 5ms for up to three seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..600 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Declares an extension named `$name` that does nothing.
macro_rules! noop_extension {
    ($ty:ident, $name:expr) => {
        struct $ty;

        impl extension_hub::Extension for $ty {
            fn name(&self) -> &str {
                $name
            }

            fn version(&self) -> &str {
                "1.0.0"
            }
        }

        impl extension_hub::ExtensionType for $ty {
            fn new(_runtime: extension_hub::ExtensionRuntime) -> Option<Self> {
                Some($ty)
            }
        }
    };
}

/// Declares an extension named `$name` appending the name of every custom
/// event it sees to the static `$log`.
macro_rules! recording_extension {
    ($ty:ident, $name:expr, $log:ident) => {
        static $log: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());

        struct $ty {
            runtime: extension_hub::ExtensionRuntime,
        }

        impl extension_hub::Extension for $ty {
            fn name(&self) -> &str {
                $name
            }

            fn version(&self) -> &str {
                "1.0.0"
            }

            fn on_registered(&self) {
                self.runtime.register_listener(
                    extension_hub::event_type::CUSTOM,
                    extension_hub::event_source::WILDCARD,
                    |event: &extension_hub::Event| {
                        $log.lock().unwrap().push(event.name().to_string());
                    },
                );
            }
        }

        impl extension_hub::ExtensionType for $ty {
            fn new(runtime: extension_hub::ExtensionRuntime) -> Option<Self> {
                Some($ty { runtime })
            }
        }
    };
}

/// Generates the `Context`, `Diagnostics` and `State` types plus the run loop
/// and error policy shared by every controller in this crate.
#[macro_export]
macro_rules! controller_scaffold {
    (
        controller_ty: $resource:ty,
        reporter: $reporter:expr,
        run_fn: $run_fn:ident,
        reconcile_fn: $reconcile_fn:path,
        error_policy_fn: $error_policy_fn:ident,
        error_requeue_secs: $requeue_secs:expr,
        api_builder: $api_builder:expr,
        watcher_config: $watcher_config:expr
        $(, watches: $watches:expr)?
        $(, preflight: $preflight:expr)?
    ) => {
        #[allow(unused_imports)]
        use futures::StreamExt;

        #[derive(Clone)]
        pub struct Context {
            /// Kubernetes client shared with reconciler helpers
            pub client: kube::Client,
            /// Event recorder for publishing Kubernetes Events
            pub recorder: kube::runtime::events::Recorder,
            /// Diagnostics shared with HTTP server
            pub diagnostics: std::sync::Arc<tokio::sync::RwLock<Diagnostics>>,
            /// Operator settings and the AVI session pool
            pub shared: std::sync::Arc<$crate::phases::Shared>,
        }

        impl Context {
            pub async fn touch(&self) {
                self.diagnostics.write().await.last_event = chrono::Utc::now();
            }
        }

        #[derive(Clone, serde::Serialize)]
        pub struct Diagnostics {
            pub last_event: chrono::DateTime<chrono::Utc>,
            #[serde(skip)]
            pub reporter: kube::runtime::events::Reporter,
        }
        impl Default for Diagnostics {
            fn default() -> Self {
                Self {
                    last_event: chrono::Utc::now(),
                    reporter: $reporter.into(),
                }
            }
        }
        impl Diagnostics {
            fn recorder(&self, client: kube::Client) -> kube::runtime::events::Recorder {
                kube::runtime::events::Recorder::new(client, self.reporter.clone())
            }
        }

        #[derive(Clone)]
        pub struct State {
            diagnostics: std::sync::Arc<tokio::sync::RwLock<Diagnostics>>,
            shared: std::sync::Arc<$crate::phases::Shared>,
        }

        impl State {
            pub fn new(shared: std::sync::Arc<$crate::phases::Shared>) -> Self {
                Self {
                    diagnostics: Default::default(),
                    shared,
                }
            }

            pub async fn diagnostics(&self) -> Diagnostics {
                self.diagnostics.read().await.clone()
            }

            pub async fn to_context(&self, client: kube::Client) -> std::sync::Arc<Context> {
                std::sync::Arc::new(Context {
                    client: client.clone(),
                    recorder: self.diagnostics.read().await.recorder(client),
                    diagnostics: self.diagnostics.clone(),
                    shared: self.shared.clone(),
                })
            }
        }

        fn $error_policy_fn(
            obj: std::sync::Arc<$resource>,
            error: &$crate::Error,
            _: std::sync::Arc<Context>,
        ) -> kube::runtime::controller::Action {
            use kube::ResourceExt;
            use kube::runtime::controller::Action;
            tracing::warn!("reconcile of {} failed: {}", obj.name_any(), error);
            match error.kind() {
                $crate::ErrorKind::PreconditionNotMet => {
                    Action::requeue(std::time::Duration::from_secs(60))
                }
                $crate::ErrorKind::InvalidInput | $crate::ErrorKind::Fatal => Action::await_change(),
                _ => Action::requeue($crate::helper::jittered(std::time::Duration::from_secs(
                    ($requeue_secs) as u64,
                ))),
            }
        }

        pub async fn $run_fn(state: State, client: kube::Client) {
            let api: kube::Api<$resource> = ($api_builder)(client.clone());
            $( ($preflight)(api.clone()).await; )?
            let controller = kube::runtime::controller::Controller::new(api, $watcher_config);
            $( let controller = ($watches)(controller, client.clone(), state.shared.clone()); )?
            controller
                .shutdown_on_signal()
                .run(
                    $reconcile_fn,
                    $error_policy_fn,
                    state.to_context(client.clone()).await,
                )
                .filter_map(async |x| std::result::Result::ok(x))
                .for_each(async |_| ())
                .await;
        }
    };
}

//! Process wiring: builds the broker with every route, starts the background
//! tasks that feed it and serves WebSocket clients until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::broker::Broker;
use crate::config::{PollerSettings, Settings};
use crate::feeds::{
    BarsFeed, BarsRequest, BarsSource, MarketSimulator, MockLedger, OrderBookFeed, OrdersFeed,
    PositionsFeed, QuotesFeed, Resolution, announce_market_status, forward_executions,
    simulate_activity,
};
use crate::poller::{Poller, PollingBroadcaster};
use crate::transport::{ServerContext, start_websocket_server};
use crate::utils::error::EngineError;

const LEDGER_EVENT_BUFFER: usize = 1024;

pub struct App {
    context: ServerContext,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Register the routes and spawn the poller, the executions forwarder and
    /// the simulations. Must be called from within a tokio runtime.
    pub fn build(settings: &Settings) -> Result<Self, EngineError> {
        let feeds = &settings.feeds;
        let broker = Broker::new(settings);
        let simulator = Arc::new(MarketSimulator::new(feeds.seed));
        let ledger = Arc::new(MockLedger::new(LEDGER_EVENT_BUFFER));
        let quote_interval = millis("feeds.quote_interval_ms", feeds.quote_interval_ms)?;
        let book_interval = millis("feeds.book_interval_ms", feeds.book_interval_ms)?;

        broker.register_route("bars", BarsFeed::new(simulator.clone(), feeds.history_bars))?;
        broker.register_route("quotes", QuotesFeed::new(simulator.clone(), quote_interval))?;
        broker.register_route("orderbook", OrderBookFeed::new(simulator.clone(), book_interval))?;
        broker.register_route("orders", OrdersFeed::new(ledger.clone()))?;
        broker.register_route("positions", PositionsFeed::new(ledger.clone()))?;

        let poller = Arc::new(PollingBroadcaster::new(
            &broker,
            BarsSource::new(simulator.clone()),
            bars_targets(&settings.poller)?,
            millis("poller.interval_ms", settings.poller.interval_ms)?,
        )?);

        let mut tasks = vec![
            tokio::spawn(poller.clone().run()),
            tokio::spawn(forward_executions(broker.downgrade(), ledger.subscribe())),
        ];
        if feeds.status_interval_ms > 0 {
            tasks.push(tokio::spawn(announce_market_status(
                broker.downgrade(),
                simulator.clone(),
                Duration::from_millis(feeds.status_interval_ms),
            )));
        }
        if feeds.activity_interval_ms > 0 {
            tasks.push(tokio::spawn(simulate_activity(
                ledger.clone(),
                simulator,
                feeds.accounts.clone(),
                settings.poller.symbols.clone(),
                Duration::from_millis(feeds.activity_interval_ms),
                feeds.seed,
            )));
        }

        let pollers: Vec<Arc<dyn Poller>> = vec![poller];
        Ok(Self {
            context: ServerContext::new(broker, pollers),
            tasks,
        })
    }

    pub fn context(&self) -> ServerContext {
        self.context.clone()
    }

    pub fn broker(&self) -> &Broker {
        &self.context.broker
    }

    /// Stop the background tasks and every producer.
    pub fn shutdown(self) {
        for poller in self.context.pollers.iter() {
            poller.stop();
        }
        for task in &self.tasks {
            task.abort();
        }
        self.context.broker.shutdown();
    }
}

/// Every configured (symbol, resolution) pair for the bars poller.
pub fn bars_targets(poller: &PollerSettings) -> Result<Vec<BarsRequest>, EngineError> {
    let resolutions = poller
        .resolutions
        .iter()
        .map(|r| r.parse::<Resolution>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::Config(format!("poller.resolutions: {e}")))?;

    Ok(poller
        .symbols
        .iter()
        .flat_map(|symbol| {
            resolutions.iter().map(move |&resolution| BarsRequest {
                symbol: symbol.clone(),
                resolution,
            })
        })
        .collect())
}

fn millis(key: &str, value: u64) -> Result<Duration, EngineError> {
    if value == 0 {
        return Err(EngineError::Config(format!("{key} must be positive")));
    }
    Ok(Duration::from_millis(value))
}

/// Run the server until it fails or Ctrl-C is received.
pub async fn run_server(settings: Settings) -> Result<(), EngineError> {
    let app = App::build(&settings)?;
    info!(routes = ?app.broker().route_names(), "feeds ready");

    let bind_address = settings.bind_address();
    let outcome = tokio::select! {
        result = start_websocket_server(&bind_address, app.context()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };

    app.shutdown();
    outcome
}

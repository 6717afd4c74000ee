//! A price feed publishing quotes to subscribers that come and go.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use relay::{Observe, Observer, SafeLock, Signal};

#[derive(Clone, Debug)]
struct Quote {
    symbol: &'static str,
    price_cents: u64,
}

#[derive(Default)]
struct Portfolio {
    observer: Observer<SafeLock>,
    value_cents: AtomicU64,
}

impl Observe<SafeLock> for Portfolio {
    fn observer(&self) -> &Observer<SafeLock> {
        &self.observer
    }
}

impl Portfolio {
    fn on_quote(&self, quote: &Quote) {
        self.value_cents.fetch_add(quote.price_cents, Ordering::Relaxed);
    }
}

fn main() {
    let quotes = Arc::new(Signal::<Quote, (), SafeLock>::new());

    let portfolio = Arc::new(Portfolio::default());
    quotes.connect_observer(&portfolio, Portfolio::on_quote);

    let printer = Arc::new(|quote: &Quote| {
        println!(
            "{} is at {}.{:02}",
            quote.symbol,
            quote.price_cents / 100,
            quote.price_cents % 100
        );
    });
    quotes.connect(&printer);

    let feed = thread::spawn({
        let quotes = Arc::clone(&quotes);
        move || {
            let ticks = [("ACME", 12_345), ("INITECH", 9_900), ("ACME", 12_400)];

            for (symbol, price_cents) in ticks {
                quotes.fire(&Quote { symbol, price_cents });
            }
        }
    });

    feed.join().unwrap();

    println!(
        "portfolio saw {} cents worth of quotes",
        portfolio.value_cents.load(Ordering::Relaxed)
    );

    // Dropping the portfolio removes it from the feed without any explicit disconnect.
    drop(portfolio);
    println!("connections left: {}", quotes.len());

    quotes.disconnect(&printer);
    assert!(quotes.is_empty());
}

mod coinmarketcap;

pub use coinmarketcap::CoinMarketCapSource;

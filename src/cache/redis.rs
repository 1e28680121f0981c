use async_trait::async_trait;
use log::{ debug, warn };
use redis::aio::MultiplexedConnection;
use redis::{ AsyncCommands, Client };

use crate::cache::{ CacheOp, DistributedCache };
use crate::config::Args;
use crate::error::Result;

const DELETE_BATCH: usize = 100;

pub struct RedisCache {
    client: Client,
    scan_count: usize,
}

impl RedisCache {
    pub fn new(args: &Args) -> Result<Self> {
        Ok(Self {
            client: Client::open(args.cache_host.as_str())?,
            scan_count: args.cache_scan_count.max(10),
        })
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.get_connection().await.ok()?;
        match conn.get::<_, String>(key).await {
            Ok(val) => Some(val),
            Err(_) => None,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> bool {
        let mut conn = match self.get_connection().await {
            Ok(c) => c,
            Err(e) => {
                debug!("Cache set skipped, no connection: {}", e);
                return false;
            }
        };
        let result = match ttl {
            Some(secs) => conn.set_ex::<_, _, ()>(key, value, secs).await,
            None => conn.set::<_, _, ()>(key, value).await,
        };
        result.is_ok()
    }

    async fn set_ttl(&self, key: &str, ttl: u64) -> bool {
        let mut conn = match self.get_connection().await {
            Ok(c) => c,
            Err(_) => {
                return false;
            }
        };
        conn.expire::<_, bool>(key, ttl as i64).await.unwrap_or(false)
    }

    async fn delete(&self, keys: &[String]) -> usize {
        if keys.is_empty() {
            return 0;
        }
        let mut conn = match self.get_connection().await {
            Ok(c) => c,
            Err(e) => {
                debug!("Cache delete skipped, no connection: {}", e);
                return 0;
            }
        };
        let mut removed = 0;
        for chunk in keys.chunks(DELETE_BATCH) {
            removed += conn.del::<_, usize>(chunk).await.unwrap_or(0);
        }
        removed
    }

    async fn delete_matching(&self, pattern: &str) -> usize {
        let mut conn = match self.get_connection().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Pattern delete '{}' skipped, no connection: {}", pattern, e);
                return 0;
            }
        };

        let mut matches: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let scan = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async::<_, (u64, Vec<String>)>(&mut conn).await;
            match scan {
                Ok((next, batch)) => {
                    matches.extend(batch);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Err(e) => {
                    warn!("Pattern scan '{}' aborted: {}", pattern, e);
                    break;
                }
            }
        }

        let mut removed = 0;
        for chunk in matches.chunks(DELETE_BATCH) {
            removed += conn.del::<_, usize>(chunk).await.unwrap_or(0);
        }
        removed
    }

    async fn list_push(&self, key: &str, value: &str) -> bool {
        let mut conn = match self.get_connection().await {
            Ok(c) => c,
            Err(e) => {
                debug!("List push skipped, no connection: {}", e);
                return false;
            }
        };
        conn.lpush::<_, _, i64>(key, value).await.is_ok()
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Vec<String> {
        let mut conn = match self.get_connection().await {
            Ok(c) => c,
            Err(_) => {
                return Vec::new();
            }
        };
        conn.lrange::<_, Vec<String>>(key, start, stop).await.unwrap_or_default()
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> bool {
        let mut conn = match self.get_connection().await {
            Ok(c) => c,
            Err(_) => {
                return false;
            }
        };
        conn.ltrim::<_, ()>(key, start, stop).await.is_ok()
    }

    async fn pipeline(&self, ops: Vec<CacheOp>) -> Vec<bool> {
        let count = ops.len();
        if count == 0 {
            return Vec::new();
        }
        let mut conn = match self.get_connection().await {
            Ok(c) => c,
            Err(e) => {
                debug!("Pipeline of {} ops skipped, no connection: {}", count, e);
                return vec![false; count];
            }
        };

        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                CacheOp::Set { key, value, ttl: Some(secs) } => {
                    pipe.set_ex(key, value, *secs);
                }
                CacheOp::Set { key, value, ttl: None } => {
                    pipe.set(key, value);
                }
                CacheOp::Delete { key } => {
                    pipe.del(key);
                }
                CacheOp::ListPush { key, value } => {
                    pipe.lpush(key, value);
                }
                CacheOp::ListTrim { key, start, stop } => {
                    pipe.ltrim(key, *start, *stop);
                }
                CacheOp::Expire { key, ttl } => {
                    pipe.expire(key, *ttl as i64);
                }
            }
        }

        match pipe.query_async::<_, Vec<redis::Value>>(&mut conn).await {
            Ok(_) => vec![true; count],
            Err(e) => {
                debug!("Pipeline of {} ops failed: {}", count, e);
                vec![false; count]
            }
        }
    }

    async fn health_check(&self) -> bool {
        let mut conn = match self.get_connection().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Cache health check failed to connect: {}", e);
                return false;
            }
        };
        match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            Ok(reply) => reply == "PONG",
            Err(e) => {
                warn!("Cache health check failed: {}", e);
                false
            }
        }
    }
}

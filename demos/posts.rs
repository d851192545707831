//! Posts and users example demonstrating queries, mutations and pagination.
//!
//! This example shows:
//! - Query subscription with stale-while-revalidate state
//! - A dependent query gated on another query's result
//! - Prefetching a detail page before it is opened
//! - A mutation that writes the new post into the cache and invalidates the list
//! - An infinite query loading pages by cursor
//!
//! The backend is an in-memory fake with artificial latency.
//!
//! Run with: `RUST_LOG=tears_query=debug cargo run --example posts`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tears_query::prelude::*;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LATENCY: Duration = Duration::from_millis(150);

/// A post from the API
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Post {
    id: u32,
    #[serde(rename = "userId")]
    user_id: u32,
    title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct User {
    id: u32,
    name: String,
}

#[derive(Debug, Clone)]
struct PostsPage {
    posts: Vec<Post>,
    next_page: Option<u32>,
}

/// Fake backend shared by the query functions
#[derive(Clone, Default)]
struct Api {
    posts: Arc<Mutex<Vec<Post>>>,
}

impl Api {
    fn seeded() -> Self {
        let posts = (1..=5)
            .map(|id| Post {
                id,
                user_id: id % 2 + 1,
                title: format!("Post number {id}"),
            })
            .collect();
        Self {
            posts: Arc::new(Mutex::new(posts)),
        }
    }

    fn snapshot(&self) -> Result<Vec<Post>, QueryError> {
        self.posts
            .lock()
            .map(|posts| posts.clone())
            .map_err(|_| QueryError::fetch("backend poisoned"))
    }

    async fn get_posts(self) -> Result<Vec<Post>, QueryError> {
        sleep(LATENCY).await;
        self.snapshot()
    }

    async fn get_post(self, id: u32) -> Result<Post, QueryError> {
        sleep(LATENCY).await;
        self.snapshot()?
            .into_iter()
            .find(|post| post.id == id)
            .ok_or_else(|| QueryError::fetch(format!("post {id} not found")))
    }

    async fn get_user(self, id: u32) -> Result<User, QueryError> {
        sleep(LATENCY).await;
        Ok(User {
            id,
            name: format!("User {id}"),
        })
    }

    async fn get_posts_page(self, page: u32) -> Result<PostsPage, QueryError> {
        const PAGE_SIZE: usize = 2;
        sleep(LATENCY).await;
        let posts = self.snapshot()?;
        let start = page as usize * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(posts.len());
        Ok(PostsPage {
            posts: posts.get(start..end).map(<[Post]>::to_vec).unwrap_or_default(),
            next_page: (end < posts.len()).then_some(page + 1),
        })
    }

    async fn create_post(self, title: String) -> Result<Post, MutationError> {
        sleep(LATENCY).await;
        let mut posts = self
            .posts
            .lock()
            .map_err(|_| MutationError::failed("backend poisoned"))?;
        let post = Post {
            id: posts.len() as u32 + 1,
            user_id: 1,
            title,
        };
        posts.push(post.clone());
        Ok(post)
    }
}

fn posts_query(api: &Api) -> QueryOptions<Vec<Post>> {
    let api = api.clone();
    QueryOptions::new(["posts"], move |_| api.clone().get_posts())
}

fn post_query(api: &Api, id: u32) -> QueryOptions<Post> {
    let api = api.clone();
    QueryOptions::new(query_key!["posts", id], move |_| api.clone().get_post(id))
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api = Api::seeded();
    let client = QueryClient::with_config(ClientConfig {
        queries: QueryConfig::new(Duration::from_secs(30), Duration::from_secs(300)),
        ..ClientConfig::default()
    });

    // Posts list
    let mut posts = client.subscribe(posts_query(&api))?;
    info!(loading = posts.state().is_loading(), "subscribed to posts");
    let titles: Vec<String> = posts
        .settled()
        .await
        .data()
        .map(|posts| posts.iter().map(|post| post.title.clone()).collect())
        .unwrap_or_default();
    info!(?titles, "posts loaded");

    // Hovering a link prefetches the detail page
    client.prefetch(post_query(&api, 3)).await?;
    let mut post = client.subscribe(post_query(&api, 3))?;
    info!(cached = post.state().is_success(), "opened post 3");

    // The author query waits for the post
    let mut author = client.subscribe(
        QueryOptions::new(["users", "author-of-3"], {
            let api = api.clone();
            let client = client.clone();
            move |_| {
                let user_id = client
                    .get_query_data::<Post>(query_key!["posts", 3])
                    .map(|post| post.user_id)
                    .unwrap_or_default();
                api.clone().get_user(user_id)
            }
        })
        .enabled(false),
    )?;
    let user_id = post.settled().await.data().map(|post| post.user_id);
    author.set_enabled(user_id.is_some())?;
    if let Some(user) = author.settled().await.data() {
        info!(name = %user.name, "author loaded");
    }

    // Creating a post writes it into the cache and refreshes the list
    let create = Mutation::new(&client, {
        let api = api.clone();
        move |title: String| api.clone().create_post(title)
    })
    .on_success(|client, post, _title| {
        if let Err(error) = client.set_query_data(query_key!["posts", post.id], post.clone()) {
            tracing::warn!(%error, "could not cache the new post");
        }
        if let Err(error) = client.invalidate(["posts"], InvalidateOptions::exact()) {
            tracing::warn!(%error, "could not invalidate posts");
        }
    });

    let created = create.mutate("Hello from tears-query".to_string()).await?;
    info!(id = created.id, "post created");
    let count = posts.settled().await.data().map(Vec::len);
    info!(?count, "posts refetched after mutation");

    // Infinite feed
    let api_for_pages = api.clone();
    let mut feed = client.subscribe_infinite(InfiniteQueryOptions::new(
        ["posts", "infinite"],
        0,
        move |_, page| api_for_pages.clone().get_posts_page(page),
        |last: &PostsPage, _all: &[PostsPage]| last.next_page,
    ))?;
    feed.settled().await;
    while feed.has_next_page() {
        feed.fetch_next_page().await;
    }
    let loaded: usize = feed.pages().iter().map(|page| page.posts.len()).sum();
    info!(pages = feed.pages().len(), loaded, "infinite feed loaded");

    info!(entries = client.len(), "done");
    Ok(())
}

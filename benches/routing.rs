use criterion::{black_box, criterion_group, criterion_main, Criterion};
use http::Method;
use pode::pipeline::noop_handler;
use pode::router::{Route, Router};

fn build_router() -> Router {
    let mut router = Router::new();
    let patterns = [
        "/",
        "/zoo/animals",
        "/zoo/animals/:id",
        "/zoo/animals/:id/meals/:meal",
        "/zoo/keepers",
        "/zoo/keepers/:id",
        "/zoo/health",
        "/public/**",
        "/reports/*/summary",
    ];
    for pattern in patterns {
        router
            .add(Route::new(Some(Method::GET), pattern, noop_handler()).unwrap())
            .unwrap();
    }
    router
        .add(Route::new(None, "/fallback", noop_handler()).unwrap())
        .unwrap();
    router
}

fn bench_route_match(c: &mut Criterion) {
    let router = build_router();

    c.bench_function("route_literal", |b| {
        b.iter(|| black_box(router.route(&Method::GET, black_box("/zoo/health"), None)))
    });

    c.bench_function("route_params", |b| {
        b.iter(|| {
            black_box(router.route(
                &Method::GET,
                black_box("/zoo/animals/1234/meals/breakfast"),
                None,
            ))
        })
    });

    c.bench_function("route_miss", |b| {
        b.iter(|| black_box(router.route(&Method::GET, black_box("/nope/nope/nope"), None)))
    });

    c.bench_function("route_remainder", |b| {
        b.iter(|| {
            black_box(router.route(
                &Method::GET,
                black_box("/public/css/deep/nested/site.css"),
                None,
            ))
        })
    });
}

criterion_group!(benches, bench_route_match);
criterion_main!(benches);

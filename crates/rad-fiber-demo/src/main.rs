use std::{cell::Cell, rc::Rc};

use rad_fiber::{Fiber, Result};
use tracing::info;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// A generator that never finishes on its own: it yields Fibonacci numbers until its handle is dropped.
fn fibonacci(out: Rc<Cell<Option<u64>>>) -> Result<Fiber> {
	Fiber::builder().name("fibonacci").stack_size(64 * 1024).build(move |mut caller| {
		let (mut a, mut b) = (0u64, 1u64);
		loop {
			out.set(Some(a));
			(a, b) = (b, a.wrapping_add(b));
			caller = caller.resume_from_any_thread();
		}
	})
}

fn main() -> Result<()> {
	let _ = tracing::subscriber::set_global_default(
		Registry::default().with(
			tracing_subscriber::fmt::layer()
				.pretty()
				.with_span_events(FmtSpan::CLOSE)
				.with_filter(EnvFilter::from_env("RADLOG")),
		),
	);

	let count = std::env::args().nth(1).and_then(|arg| arg.parse().ok()).unwrap_or(10usize);

	let out = Rc::new(Cell::new(None));
	let mut generator = fibonacci(out.clone())?;
	let here = generator.can_resume();
	let anywhere = generator.can_resume_from_any_thread();
	info!("created generator {generator}, can resume here: {here}, from any thread: {anywhere}");

	for i in 0..count {
		generator = generator.resume()?;
		if let Some(value) = out.take() {
			info!("fib({i}) = {value}");
		}
	}

	info!("generator is {:?}, dropping it", generator.affinity());
	drop(generator);
	info!("generator unwound");

	Ok(())
}

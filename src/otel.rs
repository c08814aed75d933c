// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module propagates trace context through message headers: outbound
//! publishes inject the current context, and containers extract it from each
//! delivery to parent the span the delivery is processed in.

use crate::message::{HeaderValue, Headers};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Adapter for injecting and extracting OpenTelemetry context from headers.
pub(crate) struct HeaderTracePropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

impl Extractor for HeaderTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the trace context of `ctx` into the headers.
pub(crate) fn inject(ctx: &Context, headers: &mut Headers) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderTracePropagator::new(headers))
    });
}

/// Creates a consumer span parented by the context carried in the headers.
pub(crate) fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_expose_string_headers_to_extractor() {
        let mut headers = Headers::default();
        headers.insert("traceparent".into(), HeaderValue::String("00-abc".into()));
        headers.insert("attempt".into(), HeaderValue::Int(1));

        let propagator = HeaderTracePropagator::new(&mut headers);
        assert_eq!(propagator.get("traceparent"), Some("00-abc"));
        assert_eq!(propagator.get("attempt"), None);
        assert_eq!(propagator.keys().len(), 2);
    }

    #[test]
    fn should_inject_lowercase_keys() {
        let mut headers = Headers::default();
        HeaderTracePropagator::new(&mut headers).set("TraceParent", "00-abc".into());
        assert_eq!(
            headers.get("traceparent"),
            Some(&HeaderValue::String("00-abc".into()))
        );
    }
}

//! Guest runtime shim.
//!
//! [`BOOTSTRAP`] runs in every fresh context before any guest code. It
//! captures the bridge ops in closures, installs the guest-visible globals
//! (`console`, `fetch`, `setTimeout`, `clearTimeout`), and then removes
//! `Deno`, `eval` and the function constructors so nothing else of the host
//! is reachable. [`entry_module`] generates the trusted module that invokes
//! the guest's default export.

use crate::loader::GUEST_SPECIFIER;

/// Script name used for the bootstrap, visible in stack traces.
pub const BOOTSTRAP_NAME: &str = "[scriptbox:shim]";

/// Bootstrap script run once per context.
pub const BOOTSTRAP: &str = r#"
((ops) => {
    const consoleOp = ops.op_sandbox_console;
    const fetchOp = ops.op_sandbox_fetch;
    const bodyTextOp = ops.op_sandbox_body_text;
    const timerStartOp = ops.op_sandbox_timer_start;
    const timerWaitOp = ops.op_sandbox_timer_wait;
    const timerClearOp = ops.op_sandbox_timer_clear;
    const requestOp = ops.op_sandbox_request;
    const completeOp = ops.op_sandbox_complete;

    const stringify = JSON.stringify;
    const parse = JSON.parse;
    const isArray = Array.isArray;
    const objectKeys = Object.keys;
    const freeze = Object.freeze;
    const defineProperty = Object.defineProperty;
    const ErrorCtor = Error;
    const TypeErrorCtor = TypeError;
    const MapCtor = Map;
    const SetCtor = Set;

    // --- console ---

    const MAX_DEPTH = 16;

    const project = (value, seen, depth) => {
        switch (typeof value) {
            case "undefined":
                return null;
            case "string":
            case "boolean":
                return value;
            case "number":
                return Number.isFinite(value) ? value : String(value);
            case "bigint":
                return `${value}n`;
            case "symbol":
                return value.toString();
            case "function":
                return `[Function ${value.name || "anonymous"}]`;
        }
        if (value === null) return null;
        if (value instanceof ErrorCtor) {
            return { name: value.name, message: value.message, stack: value.stack ?? null };
        }
        if (seen.has(value)) return "[Circular]";
        if (depth >= MAX_DEPTH) return isArray(value) ? "[Array]" : "[Object]";
        seen.add(value);
        try {
            if (isArray(value)) {
                return value.map((v) => project(v, seen, depth + 1));
            }
            if (value instanceof Date) {
                return Number.isNaN(value.getTime()) ? "Invalid Date" : value.toISOString();
            }
            if (value instanceof MapCtor) {
                return { "[Map]": [...value].map((e) => project(e, seen, depth + 1)) };
            }
            if (value instanceof SetCtor) {
                return { "[Set]": [...value].map((v) => project(v, seen, depth + 1)) };
            }
            const out = {};
            for (const key of objectKeys(value)) {
                out[key] = project(value[key], seen, depth + 1);
            }
            return out;
        } catch (_) {
            return "[Unserializable]";
        } finally {
            seen.delete(value);
        }
    };

    const emit = (level) => (...args) => {
        let json;
        try {
            json = stringify(args.map((a) => project(a, new SetCtor(), 0)));
        } catch (_) {
            json = '["[Unserializable]"]';
        }
        consoleOp(level, json);
    };

    const console = freeze({
        log: emit("log"),
        debug: emit("debug"),
        info: emit("info"),
        warn: emit("warn"),
        error: emit("error"),
    });

    // --- fetch ---

    const normalizeHeaders = (headers) => {
        if (headers === undefined || headers === null) return [];
        if (isArray(headers)) return headers.map(([k, v]) => [String(k), String(v)]);
        if (typeof headers.entries === "function" && typeof headers.get === "function") {
            return [...headers.entries()].map(([k, v]) => [String(k), String(v)]);
        }
        return objectKeys(headers).map((k) => [k, String(headers[k])]);
    };

    const makeResponse = (meta) => {
        let used = false;
        const lookup = new MapCtor();
        for (const [k, v] of meta.headers) {
            const key = k.toLowerCase();
            lookup.set(key, lookup.has(key) ? `${lookup.get(key)}, ${v}` : v);
        }
        const readBody = () => {
            if (used) throw new TypeErrorCtor("body has already been consumed");
            used = true;
            return bodyTextOp(meta.body);
        };
        const headers = freeze({
            get: (name) => lookup.get(String(name).toLowerCase()) ?? null,
            has: (name) => lookup.has(String(name).toLowerCase()),
            entries: () => [...lookup.entries()],
            keys: () => [...lookup.keys()],
            forEach: (cb) => lookup.forEach((v, k) => cb(v, k)),
        });
        return freeze({
            status: meta.status,
            statusText: meta.statusText,
            ok: meta.status >= 200 && meta.status < 300,
            url: meta.url,
            headers,
            get bodyUsed() {
                return used;
            },
            text: async () => readBody(),
            json: async () => parse(readBody()),
        });
    };

    const fetch = async (input, init = {}) => {
        const url = typeof input === "object" && input !== null && "url" in input
            ? String(input.url)
            : String(input);
        const method = init.method === undefined ? "GET" : String(init.method);
        const headers = normalizeHeaders(init.headers);
        let body = init.body;
        if (body !== undefined && body !== null && typeof body !== "string") {
            if (typeof body === "object") {
                body = stringify(body);
                if (!headers.some(([k]) => k.toLowerCase() === "content-type")) {
                    headers.push(["content-type", "application/json"]);
                }
            } else {
                body = String(body);
            }
        }
        const meta = parse(
            await fetchOp(stringify({ url, method, headers, body: body ?? null }))
        );
        return makeResponse(meta);
    };

    // --- timers ---

    const activeTimers = new SetCtor();

    const setTimeout = (callback, delay, ...args) => {
        if (typeof callback !== "function") {
            throw new TypeErrorCtor("setTimeout callback must be a function");
        }
        const id = timerStartOp(Number(delay) || 0);
        activeTimers.add(id);
        timerWaitOp(id).then((fired) => {
            if (!fired || !activeTimers.has(id)) return;
            activeTimers.delete(id);
            callback(...args);
        });
        return id;
    };

    const clearTimeout = (id) => {
        if (activeTimers.delete(id)) timerClearOp(id);
    };

    // --- invocation plumbing for the entry module ---

    const describeError = (err) => {
        if (err instanceof ErrorCtor) {
            return {
                name: String(err.name),
                message: String(err.message),
                stack: typeof err.stack === "string" ? err.stack : null,
            };
        }
        let message;
        try {
            message = typeof err === "string" ? err : stringify(project(err, new SetCtor(), 0));
        } catch (_) {
            message = String(err);
        }
        return { name: "Error", message: String(message), stack: null };
    };

    const host = freeze({
        request: (token) => parse(requestOp(token)),
        resolve: (token, value) => {
            if (value === undefined) {
                completeOp(token, '{"undefined":true}');
                return;
            }
            let json;
            try {
                if (typeof value === "function" || typeof value === "symbol") {
                    throw new TypeErrorCtor(`a ${typeof value} is not JSON-serializable`);
                }
                json = stringify({ ok: value });
            } catch (err) {
                completeOp(token, stringify({
                    error: {
                        name: "TypeError",
                        message: `handler result is not JSON-serializable: ${describeError(err).message}`,
                        stack: null,
                    },
                }));
                return;
            }
            completeOp(token, json);
        },
        reject: (token, err) => completeOp(token, stringify({ error: describeError(err) })),
    });

    globalThis.console = console;
    globalThis.fetch = fetch;
    globalThis.setTimeout = setTimeout;
    globalThis.clearTimeout = clearTimeout;
    defineProperty(globalThis, "__sandboxHost", {
        value: host,
        enumerable: false,
        writable: false,
        configurable: false,
    });

    // --- lockdown ---

    delete globalThis.Deno;
    delete globalThis.__bootstrap;
    delete globalThis.eval;
    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    const AsyncGeneratorFunction = (async function* () {}).constructor;
    const FunctionCtor = Function;
    for (const ctor of [FunctionCtor, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {
        defineProperty(ctor.prototype, "constructor", {
            value: undefined,
            configurable: false,
            writable: false,
        });
    }
    // Keeps `fn instanceof Function` working.
    const blockedFunction = function Function() {
        throw new TypeErrorCtor("code generation from strings is not allowed");
    };
    blockedFunction.prototype = FunctionCtor.prototype;
    globalThis.Function = blockedFunction;
})(Deno.core.ops);
"#;

/// Source of the trusted entry module for one invocation.
///
/// `token` must be a value guest code cannot know; it is checked by the
/// request and completion ops.
pub fn entry_module(token: &str) -> String {
    format!(
        r#"import handler from "{GUEST_SPECIFIER}";
const host = globalThis.__sandboxHost;
const token = "{token}";
(async () => {{
    try {{
        if (typeof handler !== "function") {{
            throw new TypeError("default export must be a function, got " + typeof handler);
        }}
        const value = await handler(host.request(token));
        host.resolve(token, value);
    }} catch (err) {{
        host.reject(token, err);
    }}
}})();
"#
    )
}

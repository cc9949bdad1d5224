// src/lua.rs - Lua scripts for atomic operations
use redis::Script;

pub struct LuaScripts {
    pub transition: Script,
    pub dequeue: Script,
    pub enqueue: Script,
}

impl LuaScripts {
    pub fn new() -> Self {
        // EVALSHA with EVAL fallback is handled by `Script::invoke_async`
        Self {
            transition: Script::new(include_str!("./lua/transition.lua")),
            dequeue: Script::new(include_str!("./lua/dequeue.lua")),
            enqueue: Script::new(include_str!("./lua/enqueue.lua")),
        }
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}

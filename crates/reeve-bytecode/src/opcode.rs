//! Opcodes for the Reeve VM
//!
//! The instruction set is partitioned into families; the interpreter has one
//! dispatch routine per family. Operands travel next to the opcode inside
//! [`crate::Instruction`] as a [`crate::Value`], so opcodes here are a plain
//! fieldless enumeration.

use serde::{Deserialize, Serialize};

/// Opcode families, used by the interpreter to route dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Pure data-stack shuffling
    Stack,
    /// Literal pushes
    Literal,
    /// Numeric arithmetic
    Arithmetic,
    /// Integer bit manipulation
    Bitwise,
    /// Truthiness logic
    Logical,
    /// Equality and ordering
    Comparison,
    /// Locals, globals, upvalues
    Variable,
    /// Jumps, calls, returns
    Control,
    /// Closure creation and invocation
    Lambda,
    /// Process lifecycle and registry
    Process,
    /// Mailbox send/receive
    Message,
    /// Supervisor management
    Supervisor,
    /// Try/throw/unwind
    Exception,
}

/// Bytecode opcode enumeration
///
/// Grouped by family. Stack-effect comments read left-to-right with the
/// stack top on the right, e.g. `( a b -- b a )`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // ===== Stack manipulation =====
    /// Discard the top value `( a -- )`
    Pop,
    /// Duplicate the top value `( a -- a a )`
    Dup,
    /// Duplicate the top two values `( a b -- a b a b )`
    Dup2,
    /// Copy the second value onto the top `( a b -- a b a )`
    Over,
    /// Swap the top two values `( a b -- b a )`
    Swap,
    /// Rotate the third value to the top `( a b c -- b c a )`
    RotUp,
    /// Rotate the top down to third `( a b c -- c a b )`
    RotDown,
    /// Drop the second value `( a b -- b )`
    Nip,
    /// Copy the top below the second `( a b -- b a b )`
    Tuck,
    /// Push the current stack depth `( -- n )`
    Depth,
    /// Copy the value at depth n onto the top (operand: n)
    Pick,
    /// Move the value at depth n to the top (operand: n)
    Roll,

    // ===== Literal pushes =====
    /// Push null
    PushNull,
    /// Push true
    PushTrue,
    /// Push false
    PushFalse,
    /// Push a signed integer (operand: int)
    PushInt,
    /// Push an unsigned integer (operand: uint)
    PushUint,
    /// Push a float (operand: float)
    PushFloat,
    /// Push a string (operand: string)
    PushString,
    /// Push a symbol (operand: string or symbol)
    PushSymbol,
    /// Push the operand value verbatim (monitor refs etc.)
    PushCustom,
    /// Push a nested code block (operand: instructions)
    PushInstructions,

    // ===== Arithmetic =====
    /// Addition `( a b -- a+b )`
    Add,
    /// Subtraction `( a b -- a-b )`
    Sub,
    /// Multiplication `( a b -- a*b )`
    Mul,
    /// Division `( a b -- a/b )`, raises on zero denominator
    Div,
    /// Modulo `( a b -- a%b )`, raises on zero denominator
    Mod,
    /// Negation `( a -- -a )`
    Neg,
    /// Absolute value `( a -- |a| )`
    Abs,
    /// Increment `( a -- a+1 )`
    Inc,
    /// Decrement `( a -- a-1 )`
    Dec,
    /// Exponentiation `( a b -- a^b )`
    Pow,
    /// Round toward negative infinity `( a -- ⌊a⌋ )`
    Floor,
    /// Round toward positive infinity `( a -- ⌈a⌉ )`
    Ceil,
    /// Round to nearest `( a -- round(a) )`
    Round,
    /// Minimum `( a b -- min )`
    Min,
    /// Maximum `( a b -- max )`
    Max,

    // ===== Bitwise =====
    /// Bitwise and `( a b -- a&b )`
    BitAnd,
    /// Bitwise or `( a b -- a|b )`
    BitOr,
    /// Bitwise xor `( a b -- a^b )`
    BitXor,
    /// Bitwise not `( a -- !a )`
    BitNot,
    /// Shift left `( a n -- a<<n )`, saturates at 64 bits
    Shl,
    /// Arithmetic shift right `( a n -- a>>n )`, sign-fills on signed
    Shr,
    /// Logical shift right `( a n -- a>>>n )`
    ShrU,

    // ===== Logical =====
    /// Truthy and `( a b -- bool )`
    And,
    /// Truthy or `( a b -- bool )`
    Or,
    /// Truthy not `( a -- bool )`
    Not,
    /// Truthy xor `( a b -- bool )`
    Xor,

    // ===== Comparison =====
    /// Structural equality, numeric cross-type `( a b -- bool )`
    Eq,
    /// Structural inequality `( a b -- bool )`
    Ne,
    /// Identity equality (lambdas, refs) `( a b -- bool )`
    Id,
    /// Identity inequality `( a b -- bool )`
    Nid,
    /// Less than `( a b -- bool )`
    Lt,
    /// Less or equal `( a b -- bool )`
    Le,
    /// Greater than `( a b -- bool )`
    Gt,
    /// Greater or equal `( a b -- bool )`
    Ge,
    /// Null test `( a -- bool )`
    IsNull,
    /// Non-null test `( a -- bool )`
    IsNotNull,

    // ===== Variables =====
    /// Load a frame-relative local (operand: slot)
    LoadLocal,
    /// Store to a frame-relative local (operand: slot)
    StoreLocal,
    /// Load a global by name (operand: string)
    LoadGlobal,
    /// Store a global by name (operand: string)
    StoreGlobal,
    /// Load a closure upvalue (operand: index)
    LoadUpvalue,
    /// Store a closure upvalue (operand: index)
    StoreUpvalue,

    // ===== Control flow =====
    /// Absolute jump (operand: target); does not pre-increment
    Jump,
    /// Relative jump forward (operand: offset from next instruction)
    JumpFwd,
    /// Relative jump backward (operand: offset from next instruction)
    JumpBwd,
    /// Jump to absolute target if top is truthy, consuming it
    JumpIfTrue,
    /// Jump to absolute target if top is falsy, consuming it
    JumpIfFalse,
    /// Jump if top is truthy, leaving it in place
    JumpIfTruePeek,
    /// Jump if top is falsy, leaving it in place
    JumpIfFalsePeek,
    /// Call a named subroutine (operand: string)
    Call,
    /// Call a subroutine whose name is popped from the stack
    CallDynamic,
    /// Call a popped code block or lambda, switching instruction lists
    CallIndirect,
    /// Call a built-in function (operand: [module, function, arity])
    CallBuiltIn,
    /// Return to the caller; empty call stack terminates the process
    Return,
    /// Return, preserving the top of stack for the caller
    ReturnValue,
    /// Terminate the process with reason Normal
    Halt,
    /// Do nothing
    Nop,

    // ===== Lambdas =====
    /// Create a lambda (operand: [body, capture-names])
    LambdaCreate,
    /// Pop n args and a lambda, invoke it inline (operand: n)
    LambdaInvoke,
    /// Pop n args and a lambda, push a partial application (operand: n)
    LambdaBind,

    // ===== Processes =====
    /// Spawn a process from popped code or lambda, push its address
    Spawn,
    /// Spawn and atomically link to the caller
    SpawnLinked,
    /// Spawn and atomically monitor; pushes address, then ref
    SpawnMonitored,
    /// Push the current process address
    SelfAddr,
    /// Terminate the current process with a popped reason
    Exit,
    /// Send an exit signal to a popped target with a popped reason
    ExitRemote,
    /// Untrappably kill a popped target
    Kill,
    /// Sleep for the operand number of seconds
    Sleep,
    /// Re-enqueue at the back of the current priority queue
    Yield,
    /// Link the current process to a popped target
    Link,
    /// Remove the link to a popped target
    Unlink,
    /// Monitor a popped target, push the monitor ref
    Monitor,
    /// Remove a popped monitor ref
    Demonitor,
    /// Start converting exit signals into mailbox messages
    TrapExitEnable,
    /// Stop trapping exit signals
    TrapExitDisable,
    /// Push whether a popped address is alive
    IsAlive,
    /// Push an info map for a popped address (null if dead/unknown)
    GetInfo,
    /// Register the current process under a popped name, push success
    Register,
    /// Drop a popped registered name, push success
    Unregister,
    /// Push the address registered under a popped name (null if none)
    WhereIs,
    /// Pop a value and a name, set a process flag
    SetFlag,
    /// Push the value of a popped flag name (null if unset)
    GetFlag,

    // ===== Messages =====
    /// Pop a target and a message value, deliver it
    Send,
    /// Schedule a delayed send (operand: delay seconds); push timer ref
    SendAfter,
    /// Receive the oldest message, parking until one arrives
    Receive,
    /// Receive with a timeout (operand: seconds); push (value, flag)
    ReceiveTimeout,
    /// Receive the first message accepted by a matcher
    ReceiveSelective,
    /// Selective receive with a timeout (operand: seconds)
    ReceiveSelectiveTimeout,
    /// Push a clone of the mailbox head without removing it
    Peek,
    /// Push the current mailbox size
    MailboxSize,
    /// Cancel a popped timer ref, push whether it was still pending
    CancelTimer,

    // ===== Supervisors =====
    /// Pop a supervisor address and a child spec map, start the child
    StartChild,
    /// Pop a supervisor address and a child id, stop the child
    StopChild,
    /// Pop a supervisor address and a child id, restart the child
    RestartChild,
    /// Pop a supervisor address, push an array of child info maps
    ListChildren,
    /// Pop a supervisor address, push a count map
    CountChildren,

    // ===== Exceptions =====
    /// Pop an error value and unwind to the nearest handler
    Throw,
    /// Re-unwind with the current exception
    Rethrow,
    /// Install a handler (operand: catch offset from next instruction)
    TryBegin,
    /// Remove the topmost handler
    TryEnd,
    /// Mark a catch entry point, recording the stack top as current
    Catch,
    /// Push an array of stack frame maps
    GetStacktrace,
}

impl Opcode {
    /// The dispatch family this opcode belongs to.
    pub fn family(self) -> Family {
        use Opcode::*;
        match self {
            Pop | Dup | Dup2 | Over | Swap | RotUp | RotDown | Nip | Tuck | Depth | Pick
            | Roll => Family::Stack,
            PushNull | PushTrue | PushFalse | PushInt | PushUint | PushFloat | PushString
            | PushSymbol | PushCustom | PushInstructions => Family::Literal,
            Add | Sub | Mul | Div | Mod | Neg | Abs | Inc | Dec | Pow | Floor | Ceil | Round
            | Min | Max => Family::Arithmetic,
            BitAnd | BitOr | BitXor | BitNot | Shl | Shr | ShrU => Family::Bitwise,
            And | Or | Not | Xor => Family::Logical,
            Eq | Ne | Id | Nid | Lt | Le | Gt | Ge | IsNull | IsNotNull => Family::Comparison,
            LoadLocal | StoreLocal | LoadGlobal | StoreGlobal | LoadUpvalue | StoreUpvalue => {
                Family::Variable
            }
            Jump | JumpFwd | JumpBwd | JumpIfTrue | JumpIfFalse | JumpIfTruePeek
            | JumpIfFalsePeek | Call | CallDynamic | CallIndirect | CallBuiltIn | Return
            | ReturnValue | Halt | Nop => Family::Control,
            LambdaCreate | LambdaInvoke | LambdaBind => Family::Lambda,
            Spawn | SpawnLinked | SpawnMonitored | SelfAddr | Exit | ExitRemote | Kill | Sleep
            | Yield | Link | Unlink | Monitor | Demonitor | TrapExitEnable | TrapExitDisable
            | IsAlive | GetInfo | Register | Unregister | WhereIs | SetFlag | GetFlag => {
                Family::Process
            }
            Send | SendAfter | Receive | ReceiveTimeout | ReceiveSelective
            | ReceiveSelectiveTimeout | Peek | MailboxSize | CancelTimer => Family::Message,
            StartChild | StopChild | RestartChild | ListChildren | CountChildren => {
                Family::Supervisor
            }
            Throw | Rethrow | TryBegin | TryEnd | Catch | GetStacktrace => Family::Exception,
        }
    }

    /// Whether the counter is incremented before this opcode reads its
    /// operands. Only the absolute `Jump` sets the counter directly.
    pub fn pre_increments(self) -> bool {
        !matches!(self, Opcode::Jump)
    }
}

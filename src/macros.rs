/// Helper macro for reading locked items
///
/// Evaluates to a `Result` holding the read guard, so callers propagate a poisoned
/// lock with `?` instead of panicking.
///
/// ```rust, ignore
///  let fields = read_lock!(object.fields)?;
///  println!("{}", fields.len());
/// ```
macro_rules! read_lock {
    ($rwlock:expr) => {
        $rwlock.read().map_err(|_| crate::Error::LockError)
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut fields = write_lock!(object.fields)?;
///  fields[0] = Value::I32(42);
/// ```
macro_rules! write_lock {
    ($rwlock:expr) => {
        $rwlock.write().map_err(|_| crate::Error::LockError)
    };
}
